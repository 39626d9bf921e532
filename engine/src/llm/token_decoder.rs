use color_eyre::Result;
use tokenizers::Tokenizer;

use crate::ModelError;

/// Turns generated token ids back into text one piece at a time.
///
/// Byte level tokenizers may split a character over several tokens, so text
/// is only released once it ends on an alphanumeric character. Whatever is
/// held back comes out of [`TokenDecoder::decode_rest`].
pub struct TokenDecoder {
    tokenizer: Tokenizer,
    tokens: Vec<u32>,
    prev_index: usize,
    current_index: usize,
}

impl TokenDecoder {
    pub fn new(tokenizer: Tokenizer) -> Self {
        Self {
            tokenizer,
            tokens: Vec::new(),
            prev_index: 0,
            current_index: 0,
        }
    }

    fn decode(&self, tokens: &[u32]) -> Result<String> {
        Ok(self
            .tokenizer
            .decode(tokens, true)
            .map_err(ModelError::tokenizer)?)
    }

    fn pending_prefix(&self) -> Result<String> {
        if self.tokens.is_empty() {
            Ok(String::new())
        } else {
            self.decode(&self.tokens[self.prev_index..self.current_index])
        }
    }

    pub fn next_token(&mut self, token: u32) -> Result<Option<String>> {
        let prev_text = self.pending_prefix()?;
        self.tokens.push(token);
        let text = self.decode(&self.tokens[self.prev_index..])?;

        let ends_clean = text.chars().last().is_some_and(char::is_alphanumeric);
        if text.len() > prev_text.len() && ends_clean {
            let (_, new_text) = text.split_at(prev_text.len());
            self.prev_index = self.current_index;
            self.current_index = self.tokens.len();
            Ok(Some(new_text.to_string()))
        } else {
            Ok(None)
        }
    }

    pub fn decode_rest(&self) -> Result<Option<String>> {
        let prev_text = self.pending_prefix()?;
        let text = self.decode(&self.tokens[self.prev_index..])?;
        if text.len() > prev_text.len() {
            let (_, new_text) = text.split_at(prev_text.len());
            Ok(Some(new_text.to_string()))
        } else {
            Ok(None)
        }
    }

    pub fn decode_all(&self) -> Result<String> {
        self.decode(&self.tokens)
    }

    pub fn token_count(&self) -> usize {
        self.tokens.len()
    }
}
