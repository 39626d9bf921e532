use std::{collections::HashMap, io::Write};

use color_eyre::Result;
use engine::{
    LLMBox,
    chain::PromptTemplate,
    llm::{LocalCausalLM, ResponseFragment},
};
use tokio_stream::StreamExt;

use crate::Session;

pub const DEFAULT_MODEL: &str = "Qwen/Qwen2.5-0.5B-Instruct";
pub const DEFAULT_QUESTION: &str =
    "What are the three most important things to consider when running a local LLM?";
pub const QUESTION_TEMPLATE: &str = indoc::indoc! {"
    Question: {question}

    Answer: Let's think step by step."};
pub const MAX_NEW_TOKENS: usize = 100;

pub async fn load_model(session: &Session, model_id: &str) -> Result<LLMBox> {
    let llm = LocalCausalLM::load(
        &session.hub,
        model_id,
        session.device.clone(),
        session.config.text_generation.clone(),
    )
    .await?;
    Ok(Box::new(llm))
}

/// Pipes the question template into `llm` and writes the answer to `out` as
/// it comes in. Returns the whole answer.
pub async fn answer(
    llm: LLMBox,
    question: &str,
    max_tokens: usize,
    out: &mut impl Write,
) -> Result<String> {
    let mut chain = PromptTemplate::from_template(QUESTION_TEMPLATE)?.pipe(llm);
    let vars = HashMap::from([("question".to_string(), question.to_string())]);

    let mut stream = chain.stream(&vars, max_tokens)?;
    let mut text = String::new();
    while let Some(fragment) = stream.try_next().await? {
        match fragment {
            ResponseFragment::TextDelta(delta) => {
                write!(out, "{delta}")?;
                out.flush()?;
            }
            ResponseFragment::MessageComplete(message) => {
                log::info!(
                    "{} prompt tokens, {} generated",
                    message.input_tokens,
                    message.output_tokens
                );
                text = message.text;
            }
        }
    }
    writeln!(out)?;
    Ok(text)
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use engine::llm::{LLM, LLMStream, OutputMessage, Request};

    use super::*;

    #[derive(Clone, Default)]
    struct ScriptedLLM {
        requests: Arc<Mutex<Vec<Request>>>,
    }

    impl LLM for ScriptedLLM {
        fn send_request_stream(&mut self, req: Request) -> LLMStream<'_> {
            self.requests.lock().unwrap().push(req);
            let fragments = vec![
                ResponseFragment::TextDelta(" 1. Memory".into()),
                ResponseFragment::TextDelta(", 2. speed".into()),
                ResponseFragment::MessageComplete(OutputMessage {
                    input_tokens: 20,
                    output_tokens: 5,
                    text: " 1. Memory, 2. speed".into(),
                }),
            ];
            Box::pin(tokio_stream::iter(fragments.into_iter().map(Ok)))
        }

        fn clone(&self) -> Box<dyn LLM + Send + 'static> {
            Box::new(Clone::clone(self))
        }
    }

    #[tokio::test]
    async fn question_reaches_the_model_in_the_template() -> Result<()> {
        let llm = ScriptedLLM::default();
        let requests = Arc::clone(&llm.requests);
        let mut out = vec![];

        let text = answer(Box::new(llm), "Why  local?", MAX_NEW_TOKENS, &mut out).await?;

        assert_eq!(text, " 1. Memory, 2. speed");
        assert_eq!(String::from_utf8(out)?, " 1. Memory, 2. speed\n");

        let requests = requests.lock().unwrap();
        assert_eq!(requests.len(), 1);
        assert_eq!(
            requests[0].prompt,
            "Question: Why  local?\n\nAnswer: Let's think step by step."
        );
        assert_eq!(requests[0].max_tokens, 100);
        Ok(())
    }
}
