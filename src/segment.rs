use serde::{Deserialize, Serialize};
use serde_with::{
    base64::{Base64, Standard},
    formats::Padded,
    serde_as,
};

/// Transport form of an isolated conjunctiva region.
#[serde_as]
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Segment {
    pub message: String,
    pub class_id: i32,
    pub score: f32,
    /// JPEG of the image with everything outside the region blacked out.
    #[serde_as(as = "Base64<Standard, Padded>")]
    pub overlay: Vec<u8>,
    /// Greyscale PNG of the refined mask.
    #[serde_as(as = "Base64<Standard, Padded>")]
    pub mask: Vec<u8>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bytes_travel_as_padded_base64() {
        let segment = Segment {
            message: "bottom eyelid isolated".into(),
            class_id: 0,
            score: 0.9,
            overlay: vec![0xFF, 0xD8, 0xFF, 0xD9],
            mask: vec![1],
        };
        let json = serde_json::to_value(&segment).unwrap();
        assert_eq!(json["overlay"], "/9j/2Q==");
        assert_eq!(json["mask"], "AQ==");

        let back: Segment = serde_json::from_value(json).unwrap();
        assert_eq!(back, segment);
    }
}
