//! Small shared helpers.

/// Generates an opaque identifier usable as a PulseAudio sink name.
///
/// Sink names end up in module arguments and device names, so they must not
/// contain spaces or quoting; a hyphen-less UUID is safe everywhere.
#[must_use]
pub fn generate_sink_id() -> String {
    format!("pulsecast_{}", uuid::Uuid::new_v4().simple())
}

/// Escapes a sink description for embedding in a double-quoted PulseAudio
/// module argument.
///
/// Backslashes and double quotes get a backslash prefix; everything else
/// (including spaces, which the surrounding quotes already protect) passes
/// through unchanged.
#[must_use]
pub fn escape_sink_description(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for c in value.chars() {
        if c == '\\' || c == '"' {
            out.push('\\');
        }
        out.push(c);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn escape_handles_quotes_and_backslashes() {
        assert_eq!(escape_sink_description(r#"a "b" \ c"#), r#"a \"b\" \\ c"#);
    }

    #[test]
    fn escape_leaves_plain_names_alone() {
        assert_eq!(escape_sink_description("Living Room TV"), "Living Room TV");
    }

    #[test]
    fn sink_ids_are_unique_and_flat() {
        let a = generate_sink_id();
        let b = generate_sink_id();
        assert_ne!(a, b);
        assert!(a.chars().all(|c| c.is_ascii_alphanumeric() || c == '_'));
    }
}
