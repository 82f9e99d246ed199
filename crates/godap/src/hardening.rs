use std::sync::Arc;

use godap_config::{init_tracing, LoggingConfig};

/// Notified with a one-line description of every panic.
pub type PanicNotifier = Arc<dyn Fn(&str) + Send + Sync + 'static>;

/// Initialize structured logging and install a process-wide panic hook that
/// records panics through `tracing` before chaining to the previous hook.
pub fn init(logging: &LoggingConfig, notifier: PanicNotifier) {
    init_tracing(logging);

    let include_backtrace = logging.include_backtrace;
    let previous = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |info| {
        let message = panic_message(info);
        let location = info
            .location()
            .map(|loc| loc.to_string())
            .unwrap_or_else(|| "<unknown>".to_string());
        if include_backtrace {
            let backtrace = std::backtrace::Backtrace::force_capture();
            tracing::error!(
                target: "godap.panic",
                { panic.message = %message, panic.location = %location, panic.backtrace = %backtrace },
                "panic captured"
            );
        } else {
            tracing::error!(
                target: "godap.panic",
                { panic.message = %message, panic.location = %location },
                "panic captured"
            );
        }
        notifier(&format!("godap panicked at {location}: {message}"));
        if cfg!(debug_assertions) {
            previous(info);
        }
    }));
}

fn panic_message(info: &std::panic::PanicHookInfo<'_>) -> String {
    if let Some(message) = info.payload().downcast_ref::<&str>() {
        return (*message).to_string();
    }
    if let Some(message) = info.payload().downcast_ref::<String>() {
        return message.clone();
    }
    "<non-string panic payload>".to_string()
}
