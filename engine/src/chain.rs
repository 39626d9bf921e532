//! A prompt template piped into a language model.

use std::collections::HashMap;

use color_eyre::{Result, eyre::bail};
use tokio_stream::StreamExt;

use crate::{
    LLMBox,
    llm::{LLMStream, Request, ResponseFragment},
};

#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Text(String),
    Var(String),
}

/// Text with `{name}` placeholders. `{{` and `}}` stand for literal braces.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PromptTemplate {
    segments: Vec<Segment>,
}

impl PromptTemplate {
    pub fn from_template(template: &str) -> Result<Self> {
        let mut segments = vec![];
        let mut text = String::new();
        let mut chars = template.char_indices().peekable();

        while let Some((pos, c)) = chars.next() {
            match c {
                '{' if chars.peek().is_some_and(|(_, n)| *n == '{') => {
                    chars.next();
                    text.push('{');
                }
                '}' if chars.peek().is_some_and(|(_, n)| *n == '}') => {
                    chars.next();
                    text.push('}');
                }
                '{' => {
                    let mut name = String::new();
                    loop {
                        match chars.next() {
                            Some((_, '}')) => break,
                            Some((_, '{')) | None => {
                                bail!("unclosed placeholder starting at byte {pos}")
                            }
                            Some((_, c)) => name.push(c),
                        }
                    }
                    let name = name.trim();
                    if name.is_empty() {
                        bail!("empty placeholder at byte {pos}");
                    }
                    if !text.is_empty() {
                        segments.push(Segment::Text(std::mem::take(&mut text)));
                    }
                    segments.push(Segment::Var(name.to_string()));
                }
                '}' => bail!("single '}}' at byte {pos}, use '}}}}' for a literal brace"),
                c => text.push(c),
            }
        }
        if !text.is_empty() {
            segments.push(Segment::Text(text));
        }

        Ok(Self { segments })
    }

    /// Placeholder names in order of first use.
    pub fn input_variables(&self) -> Vec<&str> {
        let mut names: Vec<&str> = vec![];
        for segment in &self.segments {
            if let Segment::Var(name) = segment {
                if !names.contains(&name.as_str()) {
                    names.push(name);
                }
            }
        }
        names
    }

    /// Unused entries in `vars` are ignored.
    pub fn format(&self, vars: &HashMap<String, String>) -> Result<String> {
        let mut out = String::new();
        for segment in &self.segments {
            match segment {
                Segment::Text(text) => out.push_str(text),
                Segment::Var(name) => match vars.get(name) {
                    Some(value) => out.push_str(value),
                    None => bail!("missing value for prompt variable `{name}`"),
                },
            }
        }
        Ok(out)
    }

    pub fn pipe(self, llm: LLMBox) -> Chain {
        Chain { prompt: self, llm }
    }
}

pub struct Chain {
    prompt: PromptTemplate,
    llm: LLMBox,
}

impl Chain {
    /// Formats the prompt and streams the model's answer.
    pub fn stream(
        &mut self,
        vars: &HashMap<String, String>,
        max_tokens: usize,
    ) -> Result<LLMStream<'_>> {
        let prompt = self.prompt.format(vars)?;
        log::debug!("Chain prompt: {prompt:?}");
        Ok(self.llm.send_request_stream(Request { prompt, max_tokens }))
    }

    /// Like [`Chain::stream`], but waits for the whole answer.
    pub async fn invoke(
        &mut self,
        vars: &HashMap<String, String>,
        max_tokens: usize,
    ) -> Result<String> {
        let mut stream = self.stream(vars, max_tokens)?;
        let mut text = String::new();
        while let Some(fragment) = stream.try_next().await? {
            match fragment {
                ResponseFragment::TextDelta(delta) => text.push_str(&delta),
                ResponseFragment::MessageComplete(message) => return Ok(message.text),
            }
        }
        bail!("model stopped after {} bytes without finishing", text.len())
    }
}
