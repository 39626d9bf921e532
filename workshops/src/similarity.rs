use color_eyre::Result;
use engine::embeddings::{self, SentenceEmbedder, cosine_similarity};

use crate::Session;

pub const DEFAULT_MODEL: &str = embeddings::DEFAULT_MODEL;
pub const SENTENCES: [&str; 3] = ["Hello world!", "Hi there!", "Goodbye!"];

pub async fn load_model(session: &Session, model_id: &str) -> Result<SentenceEmbedder> {
    SentenceEmbedder::load(&session.hub, model_id, session.device.clone()).await
}

/// How similar the first sentence is to each of the others.
pub fn similarity_lines(sentences: &[&str], embeddings: &[Vec<f32>]) -> Result<Vec<String>> {
    let (Some(first), Some(first_embedding)) = (sentences.first(), embeddings.first()) else {
        return Ok(vec![]);
    };

    sentences
        .iter()
        .zip(embeddings)
        .skip(1)
        .map(|(other, embedding)| {
            let similarity = cosine_similarity(first_embedding, embedding)?;
            Ok(format!(
                "Similarity between \"{first}\" and \"{other}\": {similarity}"
            ))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use expect_test::expect;

    use super::*;

    #[test]
    fn first_sentence_against_the_rest() -> Result<()> {
        let embeddings = vec![vec![1.0, 0.0], vec![1.0, 0.0], vec![0.0, 1.0]];
        expect![[r#"
            [
                "Similarity between \"Hello world!\" and \"Hi there!\": 1",
                "Similarity between \"Hello world!\" and \"Goodbye!\": 0",
            ]
        "#]]
        .assert_debug_eq(&similarity_lines(&SENTENCES, &embeddings)?);
        Ok(())
    }

    #[test]
    fn mismatched_lengths_fail() {
        let embeddings = vec![vec![1.0, 0.0], vec![1.0]];
        assert!(similarity_lines(&SENTENCES[..2], &embeddings).is_err());
    }

    #[test]
    fn nothing_to_compare() -> Result<()> {
        assert!(similarity_lines(&[], &[])?.is_empty());
        Ok(())
    }
}
