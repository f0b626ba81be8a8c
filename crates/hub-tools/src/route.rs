//! Resolve which device a `python_exec` call should run on.
//!
//! The Hub never evaluates the code itself — it only looks at it well
//! enough to find the topmost device reference, so the call can be
//! forwarded to the right Spoke. `devices.<DisplayName>.<Class>.<method>(`
//! names a specific device; a bare `device.<Class>.<method>(` means "the
//! caller's own device".

use std::sync::OnceLock;

use regex::Regex;

fn multi_device_ref() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"devices\.([A-Za-z0-9_]+)\.[A-Za-z0-9_]+\.[A-Za-z0-9_]+\s*\(").unwrap()
    })
}

/// The display name of the first `devices.<Name>....(` reference in
/// `code`, if any appears.
pub fn extract_target_display_name(code: &str) -> Option<String> {
    multi_device_ref().captures(code).map(|caps| caps[1].to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extracts_display_name_from_multi_device_call() {
        let code = "devices.Kitchen.MusicSkill.pause()";
        assert_eq!(extract_target_display_name(code), Some("Kitchen".to_string()));
    }

    #[test]
    fn bare_device_reference_yields_no_target() {
        let code = "device.MusicSkill.pause()";
        assert_eq!(extract_target_display_name(code), None);
    }

    #[test]
    fn no_device_reference_yields_no_target() {
        let code = "print('hello')";
        assert_eq!(extract_target_display_name(code), None);
    }

    #[test]
    fn finds_the_topmost_reference_when_several_appear() {
        let code = "devices.Office.Lights.on()\ndevices.Kitchen.Lights.off()";
        assert_eq!(extract_target_display_name(code), Some("Office".to_string()));
    }
}
