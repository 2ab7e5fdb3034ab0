//! Maps `Box<dyn Error>` from the hardware seams to typed `VentError`.
//!
//! The traits in `vent_traits` return `Box<dyn Error + Send + Sync>`; this
//! module converts those to our error enum, with a feature-gated path for
//! `vent_hardware::HwError` downcasting.

use crate::error::VentError;

/// Map a seam error to a typed `VentError`.
///
/// Known hardware error types are downcast first, then string heuristics apply.
pub fn map_hw_error(e: &(dyn std::error::Error + 'static)) -> VentError {
    #[cfg(feature = "hardware-errors")]
    {
        if let Some(hw) = e.downcast_ref::<vent_hardware::error::HwError>() {
            return match hw {
                vent_hardware::error::HwError::Timeout => VentError::Timeout,
                vent_hardware::error::HwError::Io(io) => VentError::Io(io.to_string()),
                other => VentError::HardwareFault(other.to_string()),
            };
        }
    }

    let s = e.to_string();
    if s.to_lowercase().contains("timeout") {
        VentError::Timeout
    } else {
        VentError::Hardware(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timeout_text_maps_to_timeout() {
        let e = std::io::Error::other("sensor read Timeout");
        assert!(matches!(map_hw_error(&e), VentError::Timeout));
    }

    #[test]
    fn other_text_is_generic_hardware() {
        let e = std::io::Error::other("bus glitch");
        assert!(matches!(map_hw_error(&e), VentError::Hardware(s) if s == "bus glitch"));
    }

    #[cfg(feature = "hardware-errors")]
    #[test]
    fn typed_hardware_errors_downcast() {
        use vent_hardware::error::HwError;
        assert!(matches!(map_hw_error(&HwError::Timeout), VentError::Timeout));
        assert!(matches!(
            map_hw_error(&HwError::Actuator("valve stuck".into())),
            VentError::HardwareFault(s) if s.contains("valve stuck")
        ));
    }
}
