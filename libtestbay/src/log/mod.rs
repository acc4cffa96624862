//! Simple re-export of logging-related macros.
pub use color_eyre::eyre::eyre;
pub use tracing::{debug, error, info, span, trace, warn};

/// Install color_eyre as the global error handler.
#[tracing::instrument]
pub fn install_color_eyre() -> color_eyre::eyre::Result<()> {
    color_eyre::config::HookBuilder::default()
        .issue_url(concat!(env!("CARGO_PKG_REPOSITORY"), "/issues/new"))
        .add_default_filters()
        .add_frame_filter(Box::new(|frames| {
            let filters = &[
                "tokio::",
                "tracing::",
                "color_eyre::",
                "<core::",
                "axum::",
                "hyper::",
            ];

            frames.retain(|frame| {
                let Some(name) = frame.name.as_ref() else {
                    return true;
                };
                !filters.iter().any(|f| name.as_str().starts_with(f))
            });
        }))
        .install()?;

    Ok(())
}
