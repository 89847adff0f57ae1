use tokio::io::{AsyncBufRead, AsyncBufReadExt};
use tokio::sync::mpsc;
use tracing::warn;

use crate::agent::AgentEvent;

/// Input events for the run loop
#[derive(Debug)]
pub enum Event {
  /// A well-formed agent event
  Agent(AgentEvent),
  /// A line that did not parse as an event
  Malformed { line: String, error: String },
}

/// Event handler that produces events from line-delimited JSON input
pub struct EventHandler {
  rx: mpsc::UnboundedReceiver<Event>,
}

impl EventHandler {
  /// Read one JSON event per line from `reader` until EOF. Blank lines are skipped.
  pub fn from_reader<R>(reader: R) -> Self
  where
    R: AsyncBufRead + Unpin + Send + 'static,
  {
    let (tx, rx) = mpsc::unbounded_channel();

    tokio::spawn(async move {
      let mut lines = reader.lines();
      loop {
        let line = match lines.next_line().await {
          Ok(Some(line)) => line,
          Ok(None) => break,
          Err(e) => {
            warn!(error = %e, "failed to read input");
            break;
          }
        };
        if line.trim().is_empty() {
          continue;
        }

        let event = match serde_json::from_str::<AgentEvent>(&line) {
          Ok(event) => Event::Agent(event),
          Err(e) => Event::Malformed {
            line,
            error: e.to_string(),
          },
        };
        if tx.send(event).is_err() {
          break;
        }
      }
    });

    Self { rx }
  }

  /// Receive the next event; `None` once the input is exhausted
  pub async fn next(&mut self) -> Option<Event> {
    self.rx.recv().await
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[tokio::test]
  async fn test_reads_events_until_eof() {
    let input: &[u8] = b"{\"event\":\"install\"}\n\n not json\n{\"event\":\"sync\",\"tag\":\"t\"}\n";
    let mut events = EventHandler::from_reader(input);

    assert!(matches!(events.next().await, Some(Event::Agent(AgentEvent::Install))));
    assert!(matches!(
      events.next().await,
      Some(Event::Malformed { ref line, .. }) if line == " not json"
    ));
    assert!(matches!(
      events.next().await,
      Some(Event::Agent(AgentEvent::Sync { ref tag })) if tag == "t"
    ));
    assert!(events.next().await.is_none());
  }
}
