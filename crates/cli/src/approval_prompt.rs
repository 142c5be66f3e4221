//! Terminal responder for pending tool approvals.

use std::io::Write;
use std::sync::Arc;

use agent::ApprovalRendezvous;
use proto::{ApprovalRequest, ApprovalResult};
use tokio::io::{AsyncBufReadExt, BufReader, Lines, Stdin};
use tokio::sync::Mutex;
use tracing::debug;

/// Stdin lines shared by the chat prompt and the approval responder.
/// Whoever needs input holds the lock only while reading one line.
pub type SharedInput = Arc<Mutex<Lines<BufReader<Stdin>>>>;

pub fn shared_stdin() -> SharedInput {
    Arc::new(Mutex::new(BufReader::new(tokio::io::stdin()).lines()))
}

/// A parsed answer to an approval prompt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Answer {
    /// Applies to the request being shown.
    One(ApprovalResult),
    /// Applies to every request pending right now.
    All(ApprovalResult),
}

/// `y`/`n`/`a` answer the shown request; upper-case `Y`/`N` answer all of
/// them. An empty line denies.
pub fn parse_answer(line: &str) -> Option<Answer> {
    match line.trim() {
        "Y" => Some(Answer::All(ApprovalResult::Approved)),
        "N" => Some(Answer::All(ApprovalResult::Denied)),
        "" => Some(Answer::One(ApprovalResult::Denied)),
        other => other.parse().ok().map(Answer::One),
    }
}

pub fn format_request(req: &ApprovalRequest, pending: usize) -> String {
    let more = if pending > 1 {
        format!(" (+{} more)", pending - 1)
    } else {
        String::new()
    };
    format!(
        "\n[approval] {}{more}\n  {}\n  allow? [y]es / [n]o / [a]lways, Y/N for all: ",
        req.tool_name, req.description
    )
}

/// Prompts for each pending request in arrival order until the rendezvous
/// goes away. A request that is resolved elsewhere (for instance by a
/// timeout) while its prompt is showing is skipped.
pub async fn respond_from_terminal(rendezvous: Arc<ApprovalRendezvous>, input: SharedInput) {
    let mut changes = rendezvous.subscribe();
    loop {
        let Some(current) = rendezvous.pending().into_iter().next() else {
            if changes.changed().await.is_err() {
                return;
            }
            continue;
        };

        eprint!("{}", format_request(&current, rendezvous.pending_count()));
        let _ = std::io::stderr().flush();

        let line = {
            let mut lines = input.lock().await;
            tokio::select! {
                line = lines.next_line() => line,
                _ = changes.wait_for(|p| !p.iter().any(|r| r.id == current.id)) => {
                    eprintln!("\n[approval] {} no longer pending", current.tool_name);
                    continue;
                }
            }
        };

        let answer = match line {
            Ok(Some(line)) => parse_answer(&line),
            Ok(None) | Err(_) => {
                debug!("stdin closed; denying pending approvals");
                rendezvous.respond_all(ApprovalResult::Denied);
                return;
            }
        };
        match answer {
            Some(Answer::One(result)) => {
                rendezvous.respond(&current.id, result);
            }
            Some(Answer::All(result)) => {
                let resolved = rendezvous.respond_all(result);
                eprintln!("[approval] answered {resolved} pending request(s)");
            }
            None => eprintln!("[approval] please answer y, n, a, Y or N"),
        }
    }
}
