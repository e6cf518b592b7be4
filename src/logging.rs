//! Logger setup for the host binary
//!
//! Every line carries a `[file:line]` prefix so log output points straight
//! back at the call site.
//!
//! Format: [file:line] LEVEL message

use std::io::Write;

use env_logger::{Builder, Env};

const CRATE_TARGET: &str = "wifi_provisioner";

/// Filter string for an explicit level, e.g. `debug` -> `wifi_provisioner=debug`.
pub fn filter_for(level: &str) -> String {
    format!("{}={}", CRATE_TARGET, level)
}

/// Install the global logger. `level` overrides `RUST_LOG` for this crate.
pub fn init(level: Option<&str>) -> anyhow::Result<()> {
    let mut builder = Builder::from_env(Env::default().default_filter_or(filter_for("info")));
    if let Some(level) = level {
        builder.parse_filters(&filter_for(level));
    }

    builder.format(|buf, record| {
        writeln!(
            buf,
            "[{}:{}] {} {}",
            record.file().unwrap_or("?"),
            record.line().unwrap_or(0),
            record.level(),
            record.args()
        )
    });

    builder.try_init()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_filter_for() {
        assert_eq!(filter_for("debug"), "wifi_provisioner=debug");
    }

    #[test]
    fn test_second_init_fails() {
        // Either this call or another test installed the logger first
        let _ = init(Some("warn"));
        assert!(init(None).is_err());
    }
}
