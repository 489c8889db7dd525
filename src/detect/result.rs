use serde::Serialize;

/// COCO class index for "person", used by common pretrained detectors.
pub const PERSON_CLASS_ID: u32 = 0;

/// Detections at or below this confidence are ignored.
pub const DEFAULT_MIN_CONFIDENCE: f32 = 0.4;

/// Axis-aligned box in frame pixel coordinates.
#[derive(Clone, Copy, Debug, PartialEq, Serialize)]
pub struct BoundingBox {
    pub x1: f32,
    pub y1: f32,
    pub x2: f32,
    pub y2: f32,
}

impl BoundingBox {
    /// Build a box from two corners in any order.
    pub fn new(x1: f32, y1: f32, x2: f32, y2: f32) -> Self {
        Self {
            x1: x1.min(x2),
            y1: y1.min(y2),
            x2: x1.max(x2),
            y2: y1.max(y2),
        }
    }

    /// Build a box from a center point and size (YOLO output layout).
    pub fn from_center(cx: f32, cy: f32, w: f32, h: f32) -> Self {
        Self::new(cx - w / 2.0, cy - h / 2.0, cx + w / 2.0, cy + h / 2.0)
    }

    pub fn width(&self) -> f32 {
        self.x2 - self.x1
    }

    pub fn height(&self) -> f32 {
        self.y2 - self.y1
    }

    pub fn area(&self) -> f32 {
        self.width().max(0.0) * self.height().max(0.0)
    }

    pub fn scale(&self, sx: f32, sy: f32) -> Self {
        Self::new(self.x1 * sx, self.y1 * sy, self.x2 * sx, self.y2 * sy)
    }

    /// Clamp to a `width` x `height` frame.
    pub fn clamp_to(&self, width: u32, height: u32) -> Self {
        let max_x = width.saturating_sub(1) as f32;
        let max_y = height.saturating_sub(1) as f32;
        Self::new(
            self.x1.clamp(0.0, max_x),
            self.y1.clamp(0.0, max_y),
            self.x2.clamp(0.0, max_x),
            self.y2.clamp(0.0, max_y),
        )
    }

    /// Intersection over union.
    pub fn iou(&self, other: &BoundingBox) -> f32 {
        let ix1 = self.x1.max(other.x1);
        let iy1 = self.y1.max(other.y1);
        let ix2 = self.x2.min(other.x2);
        let iy2 = self.y2.min(other.y2);
        let inter = (ix2 - ix1).max(0.0) * (iy2 - iy1).max(0.0);
        let union = self.area() + other.area() - inter;
        if union <= 0.0 {
            0.0
        } else {
            inter / union
        }
    }
}

/// One detected object in a frame.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct DetectionEvent {
    pub class_id: u32,
    pub bounding_box: BoundingBox,
    pub confidence: f32,
}

/// Rule that turns a frame's detections into the boolean presence signal.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct PresencePolicy {
    /// Class index the model uses for people.
    pub person_class_id: u32,
    /// Detections must score strictly above this to count.
    pub min_confidence: f32,
}

impl Default for PresencePolicy {
    fn default() -> Self {
        Self {
            person_class_id: PERSON_CLASS_ID,
            min_confidence: DEFAULT_MIN_CONFIDENCE,
        }
    }
}

impl PresencePolicy {
    pub fn is_person(&self, detection: &DetectionEvent) -> bool {
        detection.class_id == self.person_class_id && detection.confidence > self.min_confidence
    }

    /// Person detections that pass the confidence threshold.
    pub fn persons<'a>(
        &'a self,
        detections: &'a [DetectionEvent],
    ) -> impl Iterator<Item = &'a DetectionEvent> + 'a {
        detections.iter().filter(move |d| self.is_person(d))
    }

    /// True iff at least one qualifying person detection exists.
    pub fn presence(&self, detections: &[DetectionEvent]) -> bool {
        self.persons(detections).next().is_some()
    }
}

/// Greedy per-class non-maximum suppression.
///
/// Keeps the highest-confidence box of every overlapping cluster and returns
/// at most `max_detections` results ordered by confidence.
pub fn non_max_suppression(
    mut detections: Vec<DetectionEvent>,
    iou_threshold: f32,
    max_detections: usize,
) -> Vec<DetectionEvent> {
    detections.sort_by(|a, b| b.confidence.total_cmp(&a.confidence));
    let mut kept: Vec<DetectionEvent> = Vec::new();
    for candidate in detections {
        if kept.len() >= max_detections {
            break;
        }
        let suppressed = kept.iter().any(|k| {
            k.class_id == candidate.class_id
                && k.bounding_box.iou(&candidate.bounding_box) > iou_threshold
        });
        if !suppressed {
            kept.push(candidate);
        }
    }
    kept
}

#[cfg(test)]
mod tests {
    use super::*;

    fn det(class_id: u32, confidence: f32, x: f32) -> DetectionEvent {
        DetectionEvent {
            class_id,
            bounding_box: BoundingBox::new(x, 10.0, x + 50.0, 110.0),
            confidence,
        }
    }

    #[test]
    fn presence_requires_person_class_above_threshold() {
        let policy = PresencePolicy::default();
        assert!(!policy.presence(&[]));
        assert!(!policy.presence(&[det(2, 0.99, 0.0)]), "car is not a person");
        assert!(!policy.presence(&[det(0, 0.4, 0.0)]), "threshold is exclusive");
        assert!(policy.presence(&[det(2, 0.9, 0.0), det(0, 0.41, 100.0)]));
    }

    #[test]
    fn person_class_is_configurable() {
        let policy = PresencePolicy {
            person_class_id: 15,
            min_confidence: 0.2,
        };
        assert!(!policy.presence(&[det(0, 0.9, 0.0)]));
        assert!(policy.presence(&[det(15, 0.3, 0.0)]));
    }

    #[test]
    fn boxes_normalise_corner_order() {
        let b = BoundingBox::new(40.0, 30.0, 10.0, 5.0);
        assert_eq!(b, BoundingBox::new(10.0, 5.0, 40.0, 30.0));
        assert_eq!(b.width(), 30.0);
        assert_eq!(b.height(), 25.0);
        let c = BoundingBox::from_center(50.0, 50.0, 20.0, 10.0);
        assert_eq!(c, BoundingBox::new(40.0, 45.0, 60.0, 55.0));
    }

    #[test]
    fn iou_of_identical_and_disjoint_boxes() {
        let a = BoundingBox::new(0.0, 0.0, 10.0, 10.0);
        let b = BoundingBox::new(20.0, 20.0, 30.0, 30.0);
        assert!((a.iou(&a) - 1.0).abs() < f32::EPSILON);
        assert_eq!(a.iou(&b), 0.0);
    }

    #[test]
    fn clamp_keeps_box_inside_frame() {
        let b = BoundingBox::new(-5.0, -5.0, 700.0, 500.0).clamp_to(640, 480);
        assert_eq!(b, BoundingBox::new(0.0, 0.0, 639.0, 479.0));
    }

    #[test]
    fn nms_keeps_best_of_overlapping_same_class() {
        let kept = non_max_suppression(
            vec![det(0, 0.6, 0.0), det(0, 0.9, 2.0), det(0, 0.7, 300.0), det(1, 0.5, 1.0)],
            0.45,
            100,
        );
        let confidences: Vec<f32> = kept.iter().map(|d| d.confidence).collect();
        assert_eq!(confidences, vec![0.9, 0.7, 0.5]);
    }

    #[test]
    fn nms_respects_max_detections() {
        let dets = (0..10).map(|i| det(0, 0.5, i as f32 * 100.0)).collect();
        assert_eq!(non_max_suppression(dets, 0.45, 3).len(), 3);
    }
}
