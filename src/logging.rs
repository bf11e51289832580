//! Tracing subscriber setup.
//!
//! `RUST_LOG` wins when set; otherwise `mediaflow=info`, or `mediaflow=debug`
//! with `--verbose`. `RUST_LOG_FORMAT=json` switches to JSON lines. Output
//! goes to stderr so stdout stays free for results.

use tracing_subscriber::EnvFilter;

fn default_directive(verbose: bool) -> &'static str {
    if verbose { "mediaflow=debug" } else { "mediaflow=info" }
}

fn wants_json(format: Option<&str>) -> bool {
    format.map(|v| v.eq_ignore_ascii_case("json")).unwrap_or(false)
}

/// Installs the global subscriber. Later calls are no-ops.
pub fn init(verbose: bool) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_directive(verbose)));
    let format = std::env::var("RUST_LOG_FORMAT").ok();

    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(true)
        .with_file(false)
        .with_line_number(false);

    if wants_json(format.as_deref()) {
        let _ = subscriber.json().try_init();
    } else {
        let _ = subscriber.try_init();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn init_is_idempotent() {
        init(false);
        init(true);
    }

    #[test]
    fn verbosity_selects_directive() {
        assert_eq!(default_directive(false), "mediaflow=info");
        assert!(format!("{:?}", EnvFilter::new(default_directive(true))).contains("mediaflow"));
    }

    #[test]
    fn json_format_is_case_insensitive() {
        assert!(wants_json(Some("JSON")));
        assert!(!wants_json(Some("pretty")));
        assert!(!wants_json(None));
    }
}
