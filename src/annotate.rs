//! Frame annotation.
//!
//! Draws a box and a `PERSON` label around each qualifying person detection
//! and a status caption (`AC: ON` in green, `AC: OFF` in red) in the top-left
//! corner. Text is rendered with an embedded DejaVu Sans face.

use ab_glyph::{FontRef, PxScale};
use anyhow::{anyhow, Result};
use image::{Rgb, RgbImage};
use imageproc::drawing::{draw_hollow_rect_mut, draw_text_mut};
use imageproc::rect::Rect;

use crate::controller::ActuatorState;
use crate::detect::{BoundingBox, DetectionEvent, PresencePolicy};
use crate::frame::Frame;

pub const PERSON_BOX_RGB: [u8; 3] = [0, 255, 0];
pub const STATUS_ON_RGB: [u8; 3] = [0, 255, 0];
pub const STATUS_OFF_RGB: [u8; 3] = [255, 0, 0];

const FONT_DATA: &[u8] = include_bytes!("../assets/fonts/DejaVuSans.ttf");

fn label_font() -> Result<FontRef<'static>> {
    FontRef::try_from_slice(FONT_DATA).map_err(|e| anyhow!("embedded font: {}", e))
}

#[derive(Clone, Debug)]
pub struct AnnotatorStyle {
    /// Caption prefix, e.g. "AC" or "LIGHTS".
    pub actuator_label: String,
    pub box_thickness: u32,
    /// Pixel height of the `PERSON` labels.
    pub label_px: f32,
    /// Pixel height of the status caption.
    pub caption_px: f32,
}

impl Default for AnnotatorStyle {
    fn default() -> Self {
        Self {
            actuator_label: "AC".to_string(),
            box_thickness: 2,
            label_px: 16.0,
            caption_px: 28.0,
        }
    }
}

/// Stateless renderer for detections and actuator state.
#[derive(Clone, Debug, Default)]
pub struct FrameAnnotator {
    style: AnnotatorStyle,
    policy: PresencePolicy,
}

impl FrameAnnotator {
    pub fn new(policy: PresencePolicy, style: AnnotatorStyle) -> Self {
        Self { style, policy }
    }

    pub fn caption(&self, state: ActuatorState) -> String {
        format!("{}: {}", self.style.actuator_label.to_uppercase(), state)
    }

    pub fn annotate(
        &self,
        frame: &mut Frame,
        state: ActuatorState,
        detections: &[DetectionEvent],
    ) -> Result<()> {
        let font = label_font()?;
        let (width, height) = (frame.width, frame.height);
        let boxes: Vec<BoundingBox> = self
            .policy
            .persons(detections)
            .map(|person| person.bounding_box.clamp_to(width, height))
            .collect();
        let caption = self.caption(state);
        let colour = Rgb(if state.is_on() {
            STATUS_ON_RGB
        } else {
            STATUS_OFF_RGB
        });
        let style = &self.style;

        frame.draw(|img| {
            for b in &boxes {
                draw_box(img, b, style.box_thickness);

                let (x1, y1) = (b.x1 as i32, b.y1 as i32);
                let above = y1 - style.label_px.ceil() as i32 - 4;
                let label_y = if above >= 0 {
                    above
                } else {
                    y1 + style.box_thickness as i32 + 2
                };
                draw_text_mut(
                    img,
                    Rgb(PERSON_BOX_RGB),
                    x1,
                    label_y,
                    PxScale::from(style.label_px),
                    &font,
                    "PERSON",
                );
            }
            draw_text_mut(
                img,
                colour,
                10,
                10,
                PxScale::from(style.caption_px),
                &font,
                &caption,
            );
        })
    }
}

/// Hollow box, `thickness` rings drawn inwards from the detection edge.
fn draw_box(img: &mut RgbImage, b: &BoundingBox, thickness: u32) {
    let (x1, y1, x2, y2) = (b.x1 as i32, b.y1 as i32, b.x2 as i32, b.y2 as i32);
    for t in 0..thickness.max(1) as i32 {
        let (w, h) = (x2 - x1 + 1 - 2 * t, y2 - y1 + 1 - 2 * t);
        if w <= 0 || h <= 0 {
            break;
        }
        draw_hollow_rect_mut(
            img,
            Rect::at(x1 + t, y1 + t).of_size(w as u32, h as u32),
            Rgb(PERSON_BOX_RGB),
        );
    }
}
