//! JSON payloads exchanged with the recognition service.

use serde::{Deserialize, Serialize};

use crate::models::{BoundingBox, Identity, IdentityId, MatchResult, MatchScore};

#[derive(Debug, Serialize)]
pub struct RecognizeRequest<'a> {
    pub image: &'a str,
}

#[derive(Debug, Deserialize)]
pub struct RecognizeResponse {
    #[serde(default)]
    pub faces: Vec<WireFace>,
    #[serde(default)]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq)]
pub struct WireBox {
    pub x: f64,
    pub y: f64,
    pub w: f64,
    pub h: f64,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct WireFace {
    #[serde(default)]
    pub recognized: bool,
    #[serde(default)]
    pub student_id: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub confidence: Option<f32>,
    #[serde(default)]
    pub distance: Option<f32>,
    pub bbox: WireBox,
}

impl WireFace {
    pub fn into_match_result(self) -> MatchResult {
        let identity = if self.recognized {
            identity_from_wire(self.student_id, self.name)
        } else {
            None
        };

        let score = match (self.distance, self.confidence) {
            (Some(distance), _) => MatchScore::Distance(distance),
            (None, confidence) => MatchScore::Confidence(confidence.unwrap_or(0.0)),
        };

        MatchResult {
            bounding_box: BoundingBox::new(
                self.bbox.x.round() as i32,
                self.bbox.y.round() as i32,
                self.bbox.w.max(0.0).round() as u32,
                self.bbox.h.max(0.0).round() as u32,
            ),
            identity,
            score,
        }
    }
}

/// A recognized face needs at least an id or a name; the service sometimes
/// sends only one of them.
fn identity_from_wire(student_id: Option<String>, name: Option<String>) -> Option<Identity> {
    let student_id = student_id.filter(|id| !id.trim().is_empty());
    let name = name.filter(|name| !name.trim().is_empty());

    match (student_id, name) {
        (Some(id), Some(name)) => Some(Identity::new(id, name)),
        (Some(id), None) => Some(Identity::new(id.clone(), id)),
        (None, Some(name)) => Some(Identity {
            id: IdentityId::from_display_name(&name),
            display_name: name,
        }),
        (None, None) => None,
    }
}

/// Frame pushed over the streaming channel.
#[derive(Debug, Serialize)]
pub struct StreamFrame<'a> {
    #[serde(rename = "type")]
    pub kind: &'static str,
    pub image: &'a str,
    pub session_id: &'a str,
    pub frame_id: u64,
}

/// Anything the streaming channel sends back.
#[derive(Debug, Deserialize)]
pub struct StreamMessage {
    #[serde(rename = "type", default)]
    pub kind: Option<String>,
    #[serde(default)]
    pub faces: Vec<WireFace>,
    #[serde(default)]
    pub session_id: Option<String>,
    #[serde(default)]
    pub frame_id: Option<u64>,
}

impl StreamMessage {
    pub fn is_result(&self) -> bool {
        // Older servers omit the type tag on results.
        matches!(self.kind.as_deref(), None | Some("result"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn face(json: &str) -> MatchResult {
        serde_json::from_str::<WireFace>(json)
            .unwrap()
            .into_match_result()
    }

    #[test]
    fn recognized_face_carries_identity_and_confidence() {
        let result = face(
            r#"{"recognized":true,"student_id":"s-17","name":"Ada Lovelace","confidence":98.5,
                "bbox":{"x":10,"y":20,"w":30,"h":40}}"#,
        );

        assert!(result.recognized());
        assert_eq!(result.identity, Some(Identity::new("s-17", "Ada Lovelace")));
        assert_eq!(result.score, MatchScore::Confidence(98.5));
        assert_eq!(result.bounding_box, BoundingBox::new(10, 20, 30, 40));
    }

    #[test]
    fn unrecognized_face_is_unknown_even_with_name() {
        let result = face(r#"{"recognized":false,"name":"Unknown","bbox":{"x":0,"y":0,"w":5,"h":5}}"#);
        assert!(!result.recognized());
        assert_eq!(result.label(), "Unknown");
    }

    #[test]
    fn name_only_identity_uses_slug_id() {
        let result = face(r#"{"recognized":true,"name":"Grace Hopper","bbox":{"x":0,"y":0,"w":1,"h":1}}"#);
        assert_eq!(result.identity.unwrap().id.as_str(), "grace_hopper");
    }

    #[test]
    fn recognized_without_id_or_name_is_unknown() {
        let result = face(r#"{"recognized":true,"name":"  ","bbox":{"x":0,"y":0,"w":1,"h":1}}"#);
        assert!(!result.recognized());
    }

    #[test]
    fn distance_wins_over_confidence() {
        let result = face(
            r#"{"recognized":false,"confidence":12.0,"distance":0.42,"bbox":{"x":1.4,"y":1.6,"w":-3,"h":2}}"#,
        );
        assert_eq!(result.score, MatchScore::Distance(0.42));
        assert_eq!(result.bounding_box, BoundingBox::new(1, 2, 0, 2));
    }

    #[test]
    fn stream_message_without_type_is_a_result() {
        let message: StreamMessage = serde_json::from_str(r#"{"faces":[]}"#).unwrap();
        assert!(message.is_result());

        let pong: StreamMessage = serde_json::from_str(r#"{"type":"pong"}"#).unwrap();
        assert!(!pong.is_result());
    }
}
