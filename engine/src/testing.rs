//! Helpers shared by unit tests.

use tokenizers::Tokenizer;

/// Whitespace separated word-level tokenizer, ids follow the order of `words`.
/// The first word doubles as the unknown token.
pub fn word_tokenizer(words: &[&str]) -> Tokenizer {
    let vocab: serde_json::Map<String, serde_json::Value> = words
        .iter()
        .enumerate()
        .map(|(i, w)| (w.to_string(), i.into()))
        .collect();

    let json = serde_json::json!({
        "version": "1.0",
        "truncation": null,
        "padding": null,
        "added_tokens": [],
        "normalizer": null,
        "pre_tokenizer": { "type": "Whitespace" },
        "post_processor": null,
        "decoder": null,
        "model": {
            "type": "WordLevel",
            "vocab": vocab,
            "unk_token": words[0],
        },
    });

    Tokenizer::from_bytes(json.to_string().as_bytes()).expect("valid tokenizer json")
}
