pub trait Alerter: Send + Sync {
    fn alert(&self, title: &str, message: &str);
}

/// Prints alerts to the terminal.
#[derive(Debug, Default, Clone, Copy)]
pub struct TerminalAlerter;

impl Alerter for TerminalAlerter {
    fn alert(&self, title: &str, message: &str) {
        tracing::warn!(%title, %message, "alert raised");
        eprintln!("[{title}] {message}");
    }
}
