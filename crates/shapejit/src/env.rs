use std::env;
use std::sync::OnceLock;

static SHAPEJIT_DUMP_COMPUTATIONS: OnceLock<bool> = OnceLock::new();

fn parse_bool(value: &str) -> bool {
    let normalized = value.trim().to_ascii_lowercase();
    matches!(normalized.as_str(), "1" | "true" | "yes" | "on")
}

/// Whether newly specialized computations are logged in text form.
pub(crate) fn dump_computations_enabled() -> bool {
    *SHAPEJIT_DUMP_COMPUTATIONS.get_or_init(|| match env::var("SHAPEJIT_DUMP_COMPUTATIONS") {
        Ok(value) if !value.trim().is_empty() => parse_bool(&value),
        _ => false,
    })
}

#[cfg(test)]
mod tests {
    use super::parse_bool;

    #[test]
    fn parse_bool_accepts_common_spellings() {
        for value in ["1", "true", "YES", " on "] {
            assert!(parse_bool(value), "{value:?}");
        }
        for value in ["0", "false", "off", "maybe"] {
            assert!(!parse_bool(value), "{value:?}");
        }
    }
}
