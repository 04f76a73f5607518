//! Structured logging setup.
//!
//! A thin wrapper around `tracing_subscriber`, kept here rather than inlined
//! into a caller's `main` so every binary embedding this crate gets the same
//! format and `RUST_LOG` behaviour the rest of the crate's `tracing` calls
//! expect.

use tracing::level_filters::LevelFilter;
use tracing_subscriber::EnvFilter;

/// Installs a global `tracing` subscriber: env-filtered (`RUST_LOG`,
/// defaulting to `info`), with file/line numbers, ANSI colour everywhere
/// except Windows consoles where escape codes tend to show up as garbage.
pub fn init_tracing() -> crate::Result<()> {
    #[cfg(target_os = "windows")]
    let use_ansi = false;
    #[cfg(not(target_os = "windows"))]
    let use_ansi = true;

    tracing::subscriber::set_global_default(
        tracing_subscriber::FmtSubscriber::builder()
            .with_env_filter(
                EnvFilter::builder()
                    .with_default_directive(LevelFilter::INFO.into())
                    .from_env_lossy(),
            )
            .with_ansi(use_ansi)
            .with_line_number(true)
            .with_file(true)
            .finish(),
    )?;
    Ok(())
}
