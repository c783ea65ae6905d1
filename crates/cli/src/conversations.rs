//! Built-in demo conversations and the factory that starts them.
//!
//! "echo" repeats every message back until "bye"; "survey" asks a few questions and sums up.

use async_trait::async_trait;
use convo::{conversation_fn, Conversation, Message, ProcedureContext, Transport};
use std::sync::Arc;

const MAX_ATTEMPTS: usize = 3;

/// Start a conversation when the message text is one of the trigger words; ignore everything else.
pub fn demo_factory(
    msg: &Message,
    _transport: &Arc<dyn Transport>,
) -> Option<Box<dyn Conversation>> {
    match msg.text().trim().to_lowercase().as_str() {
        "echo" => Some(conversation_fn(echo)),
        "survey" => Some(Box::new(Survey::default())),
        _ => None,
    }
}

async fn echo(ctx: ProcedureContext) -> anyhow::Result<()> {
    // The trigger itself.
    ctx.read_item().await?;
    ctx.write_line("echo mode: I repeat everything, send \"bye\" to stop")
        .await?;
    loop {
        let msg = ctx.read_item().await?;
        if msg.text().trim().eq_ignore_ascii_case("bye") {
            ctx.write_line("bye").await?;
            return Ok(());
        }
        ctx.write_object(msg.content_chain().to_vec()).await?;
    }
}

#[derive(Debug, Default)]
struct Survey {
    name: String,
    age: Option<u32>,
}

impl Survey {
    fn summary(&self) -> String {
        match self.age {
            Some(age) => format!("thanks {}, noted that you are {}", self.name, age),
            None => format!("thanks {}, no age recorded", self.name),
        }
    }
}

#[async_trait]
impl Conversation for Survey {
    async fn run(self: Box<Self>, ctx: ProcedureContext) -> anyhow::Result<()> {
        let mut survey = *self;
        ctx.read_item().await?;
        ctx.write_line("what is your name?").await?;
        survey.name = ctx.read_line().await?.trim().to_string();

        ctx.write_line(format!("hi {}, how old are you?", survey.name))
            .await?;
        for attempt in 1..=MAX_ATTEMPTS {
            let answer = ctx.read_line().await?;
            match answer.trim().parse::<u32>() {
                Ok(age) => {
                    survey.age = Some(age);
                    break;
                }
                Err(_) if attempt < MAX_ATTEMPTS => {
                    ctx.write_line("please answer with a number").await?;
                }
                Err(_) => {}
            }
        }

        ctx.write_line(survey.summary()).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use convo::transport::MemoryTransport;
    use convo::Dispatcher;
    use std::time::Duration;

    fn transport() -> Arc<dyn Transport> {
        Arc::new(MemoryTransport::new())
    }

    #[test]
    fn factory_matches_trigger_words_only() {
        let t = transport();
        assert!(demo_factory(&Message::friend_text(1, " Echo "), &t).is_some());
        assert!(demo_factory(&Message::group_text(2, 1, "survey"), &t).is_some());
        assert!(demo_factory(&Message::friend_text(1, "hello"), &t).is_none());
    }

    #[test]
    fn summary_mentions_age_when_known() {
        let survey = Survey {
            name: "ann".to_string(),
            age: Some(30),
        };
        assert_eq!(survey.summary(), "thanks ann, noted that you are 30");
    }

    #[tokio::test]
    async fn survey_retries_non_numeric_age() {
        let transport = Arc::new(MemoryTransport::new());
        let dispatcher = Dispatcher::new(transport.clone(), demo_factory);
        for text in ["survey", "ann", "old", "30"] {
            dispatcher.handle_message(Message::friend_text(5, text)).await;
        }
        let sent = transport.wait_for_sent(4, Duration::from_secs(2)).await;
        let texts: Vec<String> = sent.iter().map(|s| s.text()).collect();
        assert_eq!(
            texts,
            vec![
                "what is your name?",
                "hi ann, how old are you?",
                "please answer with a number",
                "thanks ann, noted that you are 30",
            ]
        );
    }

    #[tokio::test]
    async fn echo_stops_on_bye() {
        let transport = Arc::new(MemoryTransport::new());
        let dispatcher = Dispatcher::new(transport.clone(), demo_factory);
        for text in ["echo", "one", "bye"] {
            dispatcher.handle_message(Message::temp_text(8, 5, text)).await;
        }
        let sent = transport.wait_for_sent(3, Duration::from_secs(2)).await;
        let texts: Vec<String> = sent.iter().map(|s| s.text()).collect();
        assert_eq!(texts[1..], ["one", "bye"]);
    }
}
