//! Console mode: stdin lines become inbound events, outbound sends are printed.

use convo::transport::{Destination, SentMessage};
use convo::{ContentItem, GroupInfo, TransportEvent, UserInfo};
use tokio::sync::broadcast::{self, error::RecvError};

pub const USAGE: &str = "type `friend <user> <text>`, `group <group> <user> <text>` \
     or `temp <group> <user> <text>`; /exit to quit";

/// Parse one console line into an inbound event.
pub fn parse_line(line: &str) -> Result<TransportEvent, String> {
    let (kind, rest) = split_word(line.trim());
    match kind {
        "friend" => {
            let (user, text) = split_id(rest, "user")?;
            Ok(TransportEvent::Friend {
                sender: user_info(user),
                chain: text_chain(text),
            })
        }
        "group" | "temp" => {
            let (group, rest) = split_id(rest, "group")?;
            let (user, text) = split_id(rest, "user")?;
            let group = GroupInfo {
                id: group,
                name: String::new(),
            };
            let sender = user_info(user);
            let chain = text_chain(text);
            Ok(if kind == "group" {
                TransportEvent::Group {
                    sender,
                    group,
                    chain,
                }
            } else {
                TransportEvent::Temp {
                    sender,
                    group,
                    chain,
                }
            })
        }
        other => Err(format!("unknown source {:?}; {}", other, USAGE)),
    }
}

/// One-line rendering of an outbound send.
pub fn format_sent(msg: &SentMessage) -> String {
    let to = match &msg.destination {
        Destination::User(id) => format!("user {}", id),
        Destination::Group(id) => format!("group {}", id),
        Destination::Temp { user_id, group_id } => {
            format!("temp {} via group {}", user_id, group_id)
        }
    };
    let images = msg
        .chain
        .iter()
        .filter(|c| matches!(c, ContentItem::Image { .. }))
        .count();
    if images > 0 {
        format!("[{}] {} (+{} image(s))", to, msg.text(), images)
    } else {
        format!("[{}] {}", to, msg.text())
    }
}

/// Hand every outbound send to `emit` until the transport goes away. A receiver that fell behind
/// skips the overwritten sends and keeps going.
pub async fn forward_sent(
    mut sent: broadcast::Receiver<SentMessage>,
    mut emit: impl FnMut(String),
) {
    loop {
        match sent.recv().await {
            Ok(msg) => emit(format_sent(&msg)),
            Err(RecvError::Lagged(skipped)) => {
                log::warn!("console: {} outbound message(s) not shown", skipped);
            }
            Err(RecvError::Closed) => break,
        }
    }
}

fn split_word(s: &str) -> (&str, &str) {
    match s.split_once(char::is_whitespace) {
        Some((word, rest)) => (word, rest.trim_start()),
        None => (s, ""),
    }
}

fn split_id<'a>(s: &'a str, what: &str) -> Result<(i64, &'a str), String> {
    let (word, rest) = split_word(s);
    let id = word
        .parse::<i64>()
        .map_err(|_| format!("expected {} id, got {:?}", what, word))?;
    Ok((id, rest))
}

fn user_info(id: i64) -> UserInfo {
    UserInfo {
        id,
        name: String::new(),
    }
}

fn text_chain(text: &str) -> Vec<ContentItem> {
    vec![ContentItem::plain(text)]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_friend_line() {
        let event = parse_line("friend 100 hello there").expect("parse");
        let msg = event.into_message();
        assert_eq!(msg.sender().user_id(), 100);
        assert_eq!(msg.text(), "hello there");
    }

    #[test]
    fn parses_group_and_temp_lines() {
        let group = parse_line("group 9000 100 survey").expect("parse");
        assert!(matches!(
            &group,
            TransportEvent::Group { group, sender, .. } if group.id == 9000 && sender.id == 100
        ));
        let temp = parse_line("temp 9000 100 hi").expect("parse");
        assert!(matches!(temp, TransportEvent::Temp { .. }));
    }

    #[test]
    fn rejects_bad_input() {
        assert!(parse_line("channel 1 hi").is_err());
        assert!(parse_line("friend abc hi").is_err());
        assert!(parse_line("group 1").is_err());
    }

    #[tokio::test]
    async fn forwarding_survives_a_lagging_receiver() {
        let (tx, rx) = broadcast::channel(2);
        for n in 1..=5 {
            tx.send(SentMessage {
                destination: Destination::User(n),
                chain: vec![ContentItem::plain(format!("m{}", n))],
            })
            .expect("send");
        }
        drop(tx);
        let mut lines = Vec::new();
        forward_sent(rx, |line| lines.push(line)).await;
        assert_eq!(lines, vec!["[user 4] m4", "[user 5] m5"]);
    }

    #[test]
    fn formats_destination() {
        let msg = SentMessage {
            destination: Destination::Temp {
                user_id: 1,
                group_id: 2,
            },
            chain: vec![ContentItem::plain("ok")],
        };
        assert_eq!(format_sent(&msg), "[temp 1 via group 2] ok");
    }
}
