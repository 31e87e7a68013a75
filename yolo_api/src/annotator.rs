use ab_glyph::{FontRef, InvalidFont, PxScale};
use base64::{prelude::BASE64_STANDARD, Engine};
use image::{ImageFormat, Rgb, RgbImage};
use imageproc::{
    drawing::{draw_filled_rect_mut, draw_hollow_rect_mut, draw_text_mut, text_size},
    rect::Rect,
};
use serde::Deserialize;
use std::{io::Cursor, ops::Range};
use thiserror::Error;
use yolo_schema::Detection;

static LABEL_FONT: &[u8] = include_bytes!("../assets/DejaVuSans.ttf");

#[derive(Error, Debug)]
pub enum AnnotateError {
    #[error("Failed to load label font: {0}")]
    Font(#[from] InvalidFont),
    #[error("Failed to encode annotated image: {0}")]
    Encode(#[from] image::ImageError),
}

/// Drawing constants for boxes and their labels. Distances are in pixels.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct AnnotationStyle {
    pub box_color: [u8; 3],
    pub label_background: [u8; 3],
    pub label_foreground: [u8; 3],
    pub font_size: f32,
    /// Box outline thickness as a fraction of the box width.
    pub thickness_factor: f32,
    pub min_thickness: i32,
    /// Baseline distance above the box top edge.
    pub label_offset: i32,
    /// Room required above the label for it to stay outside the box.
    pub label_margin: i32,
    /// Baseline distance below the box top edge when the label does not fit above.
    pub label_inside_offset: i32,
    pub label_padding_x: i32,
    pub label_padding_y: i32,
    pub label_border: i32,
}

impl Default for AnnotationStyle {
    fn default() -> Self {
        Self {
            box_color: [0, 100, 255],
            label_background: [0, 0, 0],
            label_foreground: [255, 255, 255],
            font_size: 66.0,
            thickness_factor: 0.005,
            min_thickness: 2,
            label_offset: 10,
            label_margin: 10,
            label_inside_offset: 30,
            label_padding_x: 10,
            label_padding_y: 5,
            label_border: 3,
        }
    }
}

impl AnnotationStyle {
    pub fn box_thickness(&self, box_width: i32) -> i32 {
        let scaled = (box_width as f32 * self.thickness_factor).round() as i32;
        scaled.max(self.min_thickness)
    }

    /// Baseline of the label text for a box whose top edge is at `y1`.
    pub fn label_baseline(&self, y1: i32, label_height: i32) -> i32 {
        let above = y1 - self.label_offset;
        if above < label_height + self.label_margin {
            y1 + self.label_inside_offset
        } else {
            above
        }
    }
}

pub fn label_text(detection: &Detection) -> String {
    format!("{}: {:.1}%", detection.name, detection.confidence * 100.0)
}

pub fn encode_png_base64(image: &RgbImage) -> Result<String, AnnotateError> {
    let mut buffer = Cursor::new(Vec::new());
    image.write_to(&mut buffer, ImageFormat::Png)?;
    Ok(BASE64_STANDARD.encode(buffer.into_inner()))
}

pub struct Annotator {
    font: FontRef<'static>,
    style: AnnotationStyle,
}

impl Annotator {
    pub fn new(style: AnnotationStyle) -> Result<Self, AnnotateError> {
        let font = FontRef::try_from_slice(LABEL_FONT)?;
        Ok(Self { font, style })
    }

    /// Draws every detection on a copy of `image` and returns it as a base64 PNG.
    pub fn annotate(
        &self,
        image: &RgbImage,
        detections: &[Detection],
    ) -> Result<String, AnnotateError> {
        let mut canvas = image.clone();
        for detection in detections {
            self.draw_detection(&mut canvas, detection);
        }
        encode_png_base64(&canvas)
    }

    fn draw_detection(&self, canvas: &mut RgbImage, detection: &Detection) {
        let style = &self.style;
        let (x1, y1, x2, y2) = detection.corners();
        let (x1, y1, x2, y2) = (x1 as i32, y1 as i32, x2 as i32, y2 as i32);

        let thickness = style.box_thickness(x2 - x1);
        draw_thick_rect(canvas, (x1, y1, x2, y2), 0..thickness, Rgb(style.box_color));

        let label = label_text(detection);
        let scale = PxScale::from(style.font_size);
        let (label_width, label_height) = text_size(scale, &self.font, &label);
        let (label_width, label_height) = (label_width as i32, label_height as i32);
        let baseline = style.label_baseline(y1, label_height);

        let background = (
            x1,
            baseline - label_height - style.label_padding_y,
            x1 + label_width + style.label_padding_x,
            baseline + style.label_padding_y,
        );
        if let Some(rect) = corner_rect(background) {
            draw_filled_rect_mut(canvas, rect, Rgb(style.label_background));
        }

        let half_border = style.label_border / 2;
        draw_thick_rect(
            canvas,
            background,
            -half_border..style.label_border - half_border,
            Rgb(style.label_foreground),
        );

        draw_text_mut(
            canvas,
            Rgb(style.label_foreground),
            x1 + style.label_padding_x / 2,
            baseline - label_height,
            scale,
            &self.font,
            &label,
        );
    }
}

/// Inclusive corners to an imageproc rect, `None` when the corners are inverted.
fn corner_rect((x1, y1, x2, y2): (i32, i32, i32, i32)) -> Option<Rect> {
    if x2 < x1 || y2 < y1 {
        return None;
    }
    Some(Rect::at(x1, y1).of_size((x2 - x1 + 1) as u32, (y2 - y1 + 1) as u32))
}

/// Draws one hollow rectangle per inset in `insets`; inset 0 lies on the corners.
fn draw_thick_rect(
    canvas: &mut RgbImage,
    (x1, y1, x2, y2): (i32, i32, i32, i32),
    insets: Range<i32>,
    color: Rgb<u8>,
) {
    for inset in insets {
        if let Some(rect) = corner_rect((x1 + inset, y1 + inset, x2 - inset, y2 - inset)) {
            draw_hollow_rect_mut(canvas, rect, color);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const BACKGROUND: Rgb<u8> = Rgb([40, 40, 40]);

    fn detection(xcenter: f32, ycenter: f32, width: f32, height: f32) -> Detection {
        Detection {
            class_id: 0,
            name: "person".to_string(),
            confidence: 0.9567,
            xcenter,
            ycenter,
            width,
            height,
        }
    }

    fn decode(encoded: &str) -> RgbImage {
        let bytes = BASE64_STANDARD.decode(encoded).unwrap();
        assert_eq!(image::guess_format(&bytes).unwrap(), ImageFormat::Png);
        image::load_from_memory(&bytes).unwrap().to_rgb8()
    }

    #[test]
    fn test_empty_detections_reencode_unchanged() {
        let img = RgbImage::from_fn(64, 48, |x, y| Rgb([x as u8, y as u8, 128]));
        let annotator = Annotator::new(AnnotationStyle::default()).unwrap();

        let encoded = annotator.annotate(&img, &[]).unwrap();

        assert_eq!(decode(&encoded), img);
    }

    #[test]
    fn test_box_corners_at_truncated_coordinates() {
        let img = RgbImage::from_pixel(400, 400, BACKGROUND);
        let style = AnnotationStyle::default();
        let color = Rgb(style.box_color);
        let annotator = Annotator::new(style).unwrap();

        // x: 149.7..250.3, y: 210..290
        let encoded = annotator
            .annotate(&img, &[detection(200.0, 250.0, 100.6, 80.0)])
            .unwrap();
        let annotated = decode(&encoded);

        assert_eq!(*annotated.get_pixel(149, 210), color);
        assert_eq!(*annotated.get_pixel(250, 210), color);
        assert_eq!(*annotated.get_pixel(149, 290), color);
        assert_eq!(*annotated.get_pixel(250, 290), color);
        // thickness 2: the third ring and the interior stay untouched
        assert_eq!(*annotated.get_pixel(151, 250), BACKGROUND);
        assert_eq!(*annotated.get_pixel(200, 260), BACKGROUND);
        assert_eq!(*annotated.get_pixel(148, 250), BACKGROUND);
    }

    #[test]
    fn test_label_background_is_drawn_above_the_box() {
        let img = RgbImage::from_pixel(400, 400, BACKGROUND);
        let annotator = Annotator::new(AnnotationStyle::default()).unwrap();

        let encoded = annotator
            .annotate(&img, &[detection(200.0, 250.0, 100.0, 80.0)])
            .unwrap();
        let annotated = decode(&encoded);

        // baseline is y1 - 10 = 200, background bottom edge at 205
        let below_background = annotated.get_pixel(150, 208);
        assert_eq!(*below_background, BACKGROUND);
        let border = annotated.get_pixel(160, 205);
        assert_eq!(*border, Rgb([255, 255, 255]));
    }

    #[test]
    fn test_boxes_outside_the_image_are_clipped() {
        let img = RgbImage::from_pixel(32, 32, BACKGROUND);
        let annotator = Annotator::new(AnnotationStyle::default()).unwrap();

        let detections = [
            detection(-50.0, -50.0, 20.0, 20.0),
            detection(30.0, 30.0, 100.0, 100.0),
            detection(10.0, 10.0, -4.0, 0.0),
        ];
        let encoded = annotator.annotate(&img, &detections).unwrap();

        assert_eq!(decode(&encoded).dimensions(), (32, 32));
    }

    #[test]
    fn test_label_baseline_above_box() {
        let style = AnnotationStyle::default();

        assert_eq!(style.label_baseline(200, 50), 190);
        assert_eq!(style.label_baseline(70, 50), 60);
    }

    #[test]
    fn test_label_baseline_moves_inside_box_near_top() {
        let style = AnnotationStyle::default();

        // 69 - 10 = 59 < 50 + 10
        assert_eq!(style.label_baseline(69, 50), 99);
        assert_eq!(style.label_baseline(0, 50), 30);
        assert_eq!(style.label_baseline(-15, 50), 15);
    }

    #[test]
    fn test_label_offset_and_margin_are_independent() {
        let style = AnnotationStyle {
            label_offset: 4,
            label_margin: 20,
            ..AnnotationStyle::default()
        };

        // 80 - 4 = 76 fits above 50 + 20
        assert_eq!(style.label_baseline(80, 50), 76);
        // 70 - 4 = 66 < 50 + 20
        assert_eq!(style.label_baseline(70, 50), 100);

        let style = AnnotationStyle {
            label_margin: 0,
            ..AnnotationStyle::default()
        };
        assert_eq!(style.label_baseline(60, 50), 50);
        assert_eq!(style.label_baseline(59, 50), 89);
    }

    #[test]
    fn test_box_thickness_scales_with_width() {
        let style = AnnotationStyle::default();

        assert_eq!(style.box_thickness(0), 2);
        assert_eq!(style.box_thickness(100), 2);
        assert_eq!(style.box_thickness(600), 3);
        assert_eq!(style.box_thickness(1000), 5);
    }

    #[test]
    fn test_label_text_formats_confidence_as_percentage() {
        let label = label_text(&detection(0.0, 0.0, 1.0, 1.0));

        assert_eq!(label, "person: 95.7%");
        assert!(label.contains("95.7%"));
    }
}
