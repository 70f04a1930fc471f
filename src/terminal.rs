use crate::io_struct::{Message, Role};
use crate::session::{ChatSession, ChatTransport, Renderer, TurnOutcome, TurnState};
use std::io::Write;
use tokio::io::{AsyncBufRead, AsyncBufReadExt};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Send(String),
    Score { index: usize, upvote: bool },
    Quit,
    Invalid(String),
}

pub fn parse_command(line: &str) -> Command {
    let trimmed = line.trim();
    let Some(rest) = trimmed.strip_prefix('/') else {
        return Command::Send(line.trim_end_matches(['\r', '\n']).to_string());
    };
    let mut parts = rest.split_whitespace();
    let upvote = match parts.next() {
        Some("quit") | Some("exit") => return Command::Quit,
        Some("up") => true,
        Some("down") => false,
        _ => return Command::Invalid(format!("unknown command: {}", trimmed)),
    };
    match parts.next().map(str::parse::<usize>) {
        Some(Ok(index)) if index > 0 => Command::Score { index, upvote },
        _ => Command::Invalid("expected a reply number, e.g. /up 1".to_string()),
    }
}

/// Prints streamed text as it arrives.
pub struct TerminalRenderer<W: Write> {
    out: W,
    current: Option<String>,
    printed: usize,
}

impl<W: Write> TerminalRenderer<W> {
    pub fn new(out: W) -> Self {
        TerminalRenderer {
            out,
            current: None,
            printed: 0,
        }
    }

    pub fn into_inner(self) -> W {
        self.out
    }

    fn end_line(&mut self) {
        if self.current.take().is_some() {
            let _ = writeln!(self.out);
        }
        self.printed = 0;
    }
}

impl<W: Write> Renderer for TerminalRenderer<W> {
    fn state_changed(&mut self, state: TurnState) {
        match state {
            TurnState::Sending => {
                let _ = writeln!(self.out, "Sending...");
            }
            TurnState::Idle => self.end_line(),
            _ => {}
        }
        let _ = self.out.flush();
    }

    fn message_updated(&mut self, message: &Message) {
        if message.role == Role::User {
            return;
        }
        if self.current.as_deref() != Some(message.id.as_str()) {
            self.end_line();
            let _ = write!(self.out, "assistant> ");
            self.current = Some(message.id.clone());
        }
        if let Some(tail) = message.content.get(self.printed..) {
            let _ = write!(self.out, "{}", tail);
        }
        self.printed = message.content.len();
        let _ = self.out.flush();
    }
}

fn scored_reply(session: &ChatSession, index: usize) -> Option<String> {
    session
        .messages()
        .iter()
        .filter(|m| session.is_scorable(&m.id))
        .nth(index - 1)
        .map(|m| m.id.clone())
}

/// Drive a session from line-oriented input until EOF or `/quit`.
pub async fn run<R, W>(
    input: R,
    out: W,
    session: &mut ChatSession,
    transport: &dyn ChatTransport,
) -> std::io::Result<W>
where
    R: AsyncBufRead + Unpin,
    W: Write,
{
    let mut renderer = TerminalRenderer::new(out);
    let mut replies = 0;
    let mut lines = input.lines();

    while let Some(line) = lines.next_line().await? {
        match parse_command(&line) {
            Command::Quit => break,
            Command::Invalid(reason) => writeln!(renderer.out, "{}", reason)?,
            Command::Send(text) => {
                if let TurnOutcome::Completed { .. } =
                    session.submit(&text, transport, &mut renderer).await
                {
                    replies += 1;
                    writeln!(renderer.out, "(reply {}, /up {} or /down {})", replies, replies, replies)?;
                }
            }
            Command::Score { index, upvote } => {
                let Some(message_id) = scored_reply(session, index) else {
                    writeln!(renderer.out, "no reply {}", index)?;
                    continue;
                };
                if upvote && session.is_upvoted(&message_id) {
                    writeln!(renderer.out, "reply {} already upvoted", index)?;
                } else if session.score(&message_id, upvote, transport).await {
                    let marker = if upvote { "[+1]" } else { "[-1]" };
                    writeln!(renderer.out, "reply {} {}", index, marker)?;
                } else {
                    writeln!(renderer.out, "could not score reply {}", index)?;
                }
            }
        }
    }
    Ok(renderer.into_inner())
}
