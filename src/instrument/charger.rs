//! Charger driven through a remote shell.
//!
//! Commands are script names; a dispatch writes one background invocation line
//! to the open shell and does not wait for an acknowledgement.

use crate::error::DispatchError;
use crate::sequence::args::is_placeholder;
use async_trait::async_trait;
use tracing::debug;

/// An interactive shell session on the charger's controller.
#[async_trait]
pub trait RemoteShell: Send + Sync {
    /// Write one line to the shell.
    async fn send(&mut self, line: &str) -> Result<(), DispatchError>;
}

/// Build the shell line that launches `script` detached.
///
/// The argument cell is passed through verbatim; a placeholder cell means
/// the script takes no arguments.
pub fn script_line(script: &str, argument_text: Option<&str>) -> String {
    match argument_text {
        Some(text) if !is_placeholder(Some(text)) => {
            format!("nohup ./{} {} & >/dev/null\n", script, text.trim())
        }
        _ => format!("nohup ./{} & >/dev/null\n", script),
    }
}

/// Live charger binding.
pub struct Charger {
    id: String,
    shell: Box<dyn RemoteShell>,
}

impl Charger {
    /// Charger `id` talking over `shell`.
    pub fn new(id: &str, shell: Box<dyn RemoteShell>) -> Self {
        Self {
            id: id.to_string(),
            shell,
        }
    }

    /// Instrument id.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Launch `script` with the raw argument cell.
    pub async fn run_script(
        &mut self,
        script: &str,
        argument_text: Option<&str>,
    ) -> Result<(), DispatchError> {
        let line = script_line(script, argument_text);
        debug!("{} <- {}", self.id, line.trim_end());
        self.shell.send(&line).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::instrument::SimulatedShell;
    use tokio_test::assert_ok;

    #[test]
    fn test_script_line_format() {
        assert_eq!(
            script_line("set_voltage_and_power.sh", Some("400 11000")),
            "nohup ./set_voltage_and_power.sh 400 11000 & >/dev/null\n"
        );
        assert_eq!(
            script_line("start_charge_session.sh", Some("-")),
            "nohup ./start_charge_session.sh & >/dev/null\n"
        );
        assert_eq!(
            script_line("stop_charge_session.sh", None),
            "nohup ./stop_charge_session.sh & >/dev/null\n"
        );
    }

    #[tokio::test]
    async fn test_run_script_writes_to_shell() {
        let shell = SimulatedShell::new();
        let lines = shell.lines();
        let mut charger = Charger::new("armxl", Box::new(shell));
        assert_ok!(charger.run_script("set_power.sh", Some("7000")).await);
        assert_eq!(
            lines.snapshot(),
            vec!["nohup ./set_power.sh 7000 & >/dev/null\n".to_string()]
        );
    }
}
