//! Vector Renderer
//!
//! Draws a [`Drawing`] as an SVG document. Each stroke becomes one path per
//! run of points sharing the same quantized pen width.

use crate::domain::models::{Drawing, Point, Stroke, PRESSURE_OUTPUT_RANGE};
use crate::domain::settings::RenderSettings;
use std::fmt::{self, Write};

/// Consecutive points drawn with one pen width, in output units
#[derive(Debug, Clone, PartialEq)]
pub struct PathSegment {
    pub width: f64,
    pub points: Vec<(f64, f64)>,
}

pub struct SvgRenderer {
    settings: RenderSettings,
}

impl SvgRenderer {
    pub fn new(settings: RenderSettings) -> Self {
        Self { settings }
    }

    /// Pen width for a pressure as a whole number of precision steps
    fn width_steps(&self, pressure: u32) -> i64 {
        let half = (PRESSURE_OUTPUT_RANGE / 2) as f64;
        let fraction = (pressure as f64 - half) / half;
        let width = self.settings.base_pen_width + self.settings.pressure_width_factor * fraction;
        (width / self.settings.width_precision).round() as i64
    }

    pub fn pen_width(&self, pressure: u32) -> f64 {
        self.width_steps(pressure) as f64 * self.settings.width_precision
    }

    fn scale(&self, point: &Point) -> (f64, f64) {
        (
            point.x * self.settings.output_scale,
            point.y * self.settings.output_scale,
        )
    }

    /// Split a stroke wherever the quantized width changes
    pub fn segments(&self, stroke: &Stroke) -> Vec<PathSegment> {
        let mut segments: Vec<PathSegment> = Vec::new();
        let mut last_steps = None;

        for point in stroke.points.iter().filter(|p| p.is_valid()) {
            let steps = self.width_steps(point.pressure);
            let scaled = self.scale(point);
            match segments.last_mut() {
                Some(segment) if last_steps == Some(steps) => segment.points.push(scaled),
                _ => segments.push(PathSegment {
                    width: steps as f64 * self.settings.width_precision,
                    points: vec![scaled],
                }),
            }
            last_steps = Some(steps);
        }

        segments
    }

    fn width_decimals(&self) -> usize {
        (-self.settings.width_precision.log10()).ceil().max(0.0) as usize
    }

    fn write_path<W: Write>(&self, out: &mut W, segment: &PathSegment) -> fmt::Result {
        let mut points = segment.points.iter();
        let Some((x, y)) = points.next() else {
            return Ok(());
        };
        write!(out, r#"  <path d="M {:.3} {:.3}"#, x, y)?;
        if segment.points.len() == 1 {
            // a lone point still leaves a dot with round caps
            write!(out, " l 0 0")?;
        }
        for (x, y) in points {
            write!(out, " L {:.3} {:.3}", x, y)?;
        }
        writeln!(
            out,
            r#"" fill="none" stroke="{}" stroke-width="{:.*}" stroke-linecap="round" stroke-linejoin="round"/>"#,
            self.settings.stroke_color,
            self.width_decimals(),
            segment.width
        )
    }

    pub fn render_to<W: Write>(&self, drawing: &Drawing, out: &mut W) -> fmt::Result {
        let width = drawing.dimensions.0 * self.settings.output_scale;
        let height = drawing.dimensions.1 * self.settings.output_scale;

        writeln!(out, r#"<?xml version="1.0" encoding="UTF-8"?>"#)?;
        writeln!(
            out,
            r#"<svg xmlns="http://www.w3.org/2000/svg" width="{w:.3}mm" height="{h:.3}mm" viewBox="0 0 {w:.3} {h:.3}">"#,
            w = width,
            h = height
        )?;
        for stroke in &drawing.strokes {
            for segment in self.segments(stroke) {
                self.write_path(out, &segment)?;
            }
        }
        writeln!(out, "</svg>")
    }

    pub fn render(&self, drawing: &Drawing) -> String {
        let mut out = String::new();
        // writing into a String cannot fail
        let _ = self.render_to(drawing, &mut out);
        out
    }
}

impl Default for SvgRenderer {
    fn default() -> Self {
        Self::new(RenderSettings::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const THIN: u32 = 0x4000; // 0.3
    const THICK: u32 = 0xC000; // 0.5

    fn point(x: f64, pressure: u32) -> Point {
        Point {
            x,
            y: 1000.0,
            pressure,
        }
    }

    fn stroke(points: Vec<Point>) -> Stroke {
        Stroke {
            points,
            ..Default::default()
        }
    }

    #[test]
    fn test_pen_width_range() {
        let renderer = SvgRenderer::default();
        assert!((renderer.pen_width(0) - 0.2).abs() < 1e-9);
        assert!((renderer.pen_width(0x8000) - 0.4).abs() < 1e-9);
        assert!((renderer.pen_width(PRESSURE_OUTPUT_RANGE) - 0.6).abs() < 1e-9);
        assert!((renderer.pen_width(THIN) - 0.3).abs() < 1e-9);
        assert!((renderer.pen_width(THICK) - 0.5).abs() < 1e-9);
    }

    #[test]
    fn test_width_change_starts_segment() {
        let renderer = SvgRenderer::default();
        let stroke = stroke(vec![
            point(0.0, THIN),
            point(10.0, THIN),
            point(20.0, THICK),
            point(30.0, THICK),
            point(40.0, THICK),
        ]);
        let segments = renderer.segments(&stroke);
        assert_eq!(segments.len(), 2);
        assert_eq!(segments[0].points.len(), 2);
        assert_eq!(segments[1].points.len(), 3);
        assert!((segments[1].points[0].0 - 0.02).abs() < 1e-9);
    }

    #[test]
    fn test_small_pressure_jitter_keeps_segment() {
        let renderer = SvgRenderer::default();
        let stroke = stroke(vec![point(0.0, 0x8000), point(1.0, 0x8100), point(2.0, 0x7F00)]);
        assert_eq!(renderer.segments(&stroke).len(), 1);
    }

    #[test]
    fn test_lost_points_are_skipped() {
        let renderer = SvgRenderer::default();
        let stroke = stroke(vec![point(0.0, THIN), Point::lost(), point(10.0, THIN)]);
        let segments = renderer.segments(&stroke);
        assert_eq!(segments.len(), 1);
        assert_eq!(segments[0].points.len(), 2);
        assert!(renderer.segments(&self::stroke(vec![Point::lost()])).is_empty());
    }

    #[test]
    fn test_document() {
        let renderer = SvgRenderer::default();
        let drawing = Drawing {
            timestamp: 0,
            dimensions: (21600.0, 14800.0),
            strokes: vec![
                stroke(vec![point(0.0, THIN), point(10.0, THIN), point(20.0, THICK)]),
                stroke(vec![Point::lost()]),
            ],
        };
        let svg = renderer.render(&drawing);
        assert!(svg.contains(r#"width="21.600mm" height="14.800mm""#));
        assert_eq!(svg.matches("<path").count(), 2);
        assert!(svg.contains(r#"d="M 0.000 1.000 L 0.010 1.000""#));
        assert!(svg.contains(r#"d="M 0.020 1.000 l 0 0""#));
        assert!(svg.contains(r#"stroke-width="0.5""#));
        assert!(!svg.contains("NaN"));
        assert!(svg.trim_end().ends_with("</svg>"));
    }
}
