//! FFmpeg video filter definitions.

use clipper_models::media::normalize_degrees;

/// Rounds both dimensions down to the nearest even number; libx264 with
/// yuv420p rejects odd sizes.
pub const EVEN_DIMENSIONS_FILTER: &str = "scale=trunc(iw/2)*2:trunc(ih/2)*2";

/// Angles closer than this to zero are treated as no rotation.
const ANGLE_EPSILON: f64 = 0.01;

/// Filter that rotates frames clockwise by `degrees`.
///
/// Right angles use lossless `transpose`; any other angle uses `rotate`,
/// growing the canvas to fit the rotated frame. Returns `None` for 0°.
pub fn rotation_filter(degrees: f64) -> Option<String> {
    let deg = normalize_degrees(degrees);
    if deg < ANGLE_EPSILON || deg > 360.0 - ANGLE_EPSILON {
        return None;
    }

    let right_angle = |target: f64| (deg - target).abs() < ANGLE_EPSILON;
    if right_angle(90.0) {
        Some("transpose=1".to_string())
    } else if right_angle(180.0) {
        Some("transpose=1,transpose=1".to_string())
    } else if right_angle(270.0) {
        Some("transpose=2".to_string())
    } else {
        Some(arbitrary_rotation(deg))
    }
}

/// Small fixed rotation applied to sources without any rotation metadata.
///
/// Negative angles rotate counter-clockwise.
pub fn corrective_rotation_filter(degrees: f64) -> Option<String> {
    if degrees.abs() < ANGLE_EPSILON {
        return None;
    }
    Some(arbitrary_rotation(degrees))
}

// The rotate filter turns clockwise for positive radians.
fn arbitrary_rotation(degrees: f64) -> String {
    let rad = format!("{:.6}", degrees.to_radians());
    format!(
        "rotate={rad}:ow=rotw({rad}):oh=roth({rad}):c=black",
        rad = rad
    )
}

/// Full re-encode filter chain: optional rotation followed by even-dimension rounding.
pub fn build_filter_chain(rotation: Option<&str>) -> String {
    match rotation {
        Some(r) => format!("{},{}", r, EVEN_DIMENSIONS_FILTER),
        None => EVEN_DIMENSIONS_FILTER.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_right_angles_use_transpose() {
        assert_eq!(rotation_filter(90.0).as_deref(), Some("transpose=1"));
        assert_eq!(rotation_filter(270.0).as_deref(), Some("transpose=2"));
        assert_eq!(rotation_filter(-90.0).as_deref(), Some("transpose=2"));
        assert_eq!(
            rotation_filter(180.0).as_deref(),
            Some("transpose=1,transpose=1")
        );
    }

    #[test]
    fn test_zero_rotation_has_no_filter() {
        assert!(rotation_filter(0.0).is_none());
        assert!(rotation_filter(360.0).is_none());
        assert!(corrective_rotation_filter(0.0).is_none());
    }

    #[test]
    fn test_arbitrary_angle_uses_rotate() {
        let filter = rotation_filter(45.0).unwrap();
        assert!(filter.starts_with("rotate=0.785398"));
        assert!(filter.contains("ow=rotw("));

        let corrective = corrective_rotation_filter(-1.5).unwrap();
        assert!(corrective.starts_with("rotate=-0.026180"));
    }

    #[test]
    fn test_chain_always_ends_with_even_rounding() {
        assert_eq!(build_filter_chain(None), EVEN_DIMENSIONS_FILTER);
        let chain = build_filter_chain(Some("transpose=1"));
        assert!(chain.starts_with("transpose=1,"));
        assert!(chain.ends_with(EVEN_DIMENSIONS_FILTER));
    }
}
