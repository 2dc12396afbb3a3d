//! Focus notifications for accessors that refetch when the console regains focus

use tokio::sync::broadcast;

/// Broadcasts "the operator is looking at this again" to every listening
/// accessor. The UI layer calls [`FocusSignal::notify`] from whatever focus
/// event its toolkit provides.
#[derive(Debug, Clone)]
pub struct FocusSignal {
    sender: broadcast::Sender<()>,
}

impl FocusSignal {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(16);
        Self { sender }
    }

    pub fn notify(&self) {
        // No listeners is fine
        let _ = self.sender.send(());
    }

    pub fn subscribe(&self) -> broadcast::Receiver<()> {
        self.sender.subscribe()
    }
}

impl Default for FocusSignal {
    fn default() -> Self {
        Self::new()
    }
}
