use crate::error::ValidationError;
use crate::sensors::SensorUpdate;

// ---------------------------------------------------------------------------
// Topics
// ---------------------------------------------------------------------------

/// Sensor nodes publish partial JSON updates here.
pub(crate) const SENSOR_TOPIC_FILTER: &str = "tele/+/sensors";

/// Extract node_id from "tele/<node_id>/sensors".
pub(crate) fn extract_node_id(topic: &str) -> Option<&str> {
    let parts: Vec<&str> = topic.split('/').collect();
    if parts.len() == 3 && parts[0] == "tele" && parts[2] == "sensors" && !parts[1].is_empty() {
        Some(parts[1])
    } else {
        None
    }
}

/// Parse and validate a telemetry payload. An empty object is rejected:
/// a node that has nothing to report should not publish.
pub(crate) fn parse_sensor_payload(payload: &[u8]) -> Result<SensorUpdate, ValidationError> {
    let update = SensorUpdate::from_json(payload)?;
    if update.is_empty() {
        return Err(ValidationError::InvalidBody("no sensor fields".into()));
    }
    update.validate()?;
    Ok(update)
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;

    // -- extract_node_id ----------------------------------------------------

    #[test]
    fn extract_node_id_valid_topic() {
        assert_eq!(extract_node_id("tele/field-esp32/sensors"), Some("field-esp32"));
    }

    #[test]
    fn extract_node_id_wrong_prefix() {
        assert_eq!(extract_node_id("cmd/field-esp32/sensors"), None);
    }

    #[test]
    fn extract_node_id_wrong_suffix() {
        assert_eq!(extract_node_id("tele/field-esp32/reading"), None);
    }

    #[test]
    fn extract_node_id_segment_count() {
        assert_eq!(extract_node_id("tele/sensors"), None);
        assert_eq!(extract_node_id("tele/a/b/sensors"), None);
        assert_eq!(extract_node_id("tele//sensors"), None);
        assert_eq!(extract_node_id(""), None);
    }

    // -- parse_sensor_payload -----------------------------------------------

    #[test]
    fn payload_partial_update() {
        let update = parse_sensor_payload(br#"{"soil_moisture": 22.5, "rain_detected": false}"#)
            .unwrap();
        assert_eq!(update.soil_moisture, Some(22.5));
        assert_eq!(update.rain_detected, Some(false));
        assert_eq!(update.temperature, None);
    }

    #[test]
    fn payload_unknown_field_rejected() {
        assert!(matches!(
            parse_sensor_payload(br#"{"soil_moisture": 30, "wind": 4}"#),
            Err(ValidationError::InvalidBody(_))
        ));
    }

    #[test]
    fn payload_out_of_range_rejected() {
        assert!(matches!(
            parse_sensor_payload(br#"{"humidity": 101}"#),
            Err(ValidationError::OutOfRange { field: "humidity", .. })
        ));
    }

    #[test]
    fn payload_empty_or_garbage_rejected() {
        assert!(parse_sensor_payload(b"{}").is_err());
        assert!(parse_sensor_payload(b"moisture=30").is_err());
        assert!(parse_sensor_payload(b"").is_err());
    }
}
