//! Built-in document tools served by the dispatcher
//!
//! `summarize_document`, `compare_documents` and `test_regex`. All three are
//! deterministic text utilities; anything model-backed stays outside the server.

use std::collections::BTreeSet;
use std::sync::OnceLock;

use async_trait::async_trait;
use regex::Regex;
use serde::Deserialize;
use serde_json::{json, Value};

use crate::domain::registry::{ToolHandler, ToolRegistry};
use crate::errors::{HandlerFailure, RegistryError};
use crate::mcp::types::ToolDescriptor;

pub const SUMMARY_SENTENCES: usize = 3;

pub fn default_registry() -> Result<ToolRegistry, RegistryError> {
    let mut registry = ToolRegistry::new();
    registry.register(SummarizeDocument::descriptor(), SummarizeDocument)?;
    registry.register(CompareDocuments::descriptor(), CompareDocuments)?;
    registry.register(TestRegex::descriptor(), TestRegex)?;
    Ok(registry)
}

fn parse_arguments<T: for<'de> Deserialize<'de>>(arguments: Value) -> Result<T, HandlerFailure> {
    serde_json::from_value(arguments)
        .map_err(|err| HandlerFailure::new(format!("invalid arguments: {err}")))
}

fn sentence_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"[^.!?]+[.!?]*").expect("valid sentence pattern"))
}

fn number_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"-?\d[\d,]*(?:\.\d+)?").expect("valid number pattern"))
}

pub struct SummarizeDocument;

#[derive(Debug, Deserialize)]
struct SummarizeParams {
    document_content: Option<String>,
    path: Option<String>,
}

impl SummarizeDocument {
    pub fn descriptor() -> ToolDescriptor {
        ToolDescriptor::new(
            "summarize_document",
            json!({
                "type": "object",
                "properties": {
                    "document_content": {
                        "type": "string",
                        "description": "The content of the document to analyze"
                    },
                    "path": {
                        "type": "string",
                        "description": "Path of a UTF-8 text file to analyze instead of inline content"
                    }
                },
                "additionalProperties": false
            }),
        )
        .with_description("Analyze and summarize document content")
    }
}

pub fn summarize(text: &str, max_sentences: usize) -> Value {
    let sentences: Vec<&str> = sentence_pattern()
        .find_iter(text)
        .map(|found| found.as_str().trim())
        .filter(|sentence| !sentence.is_empty())
        .collect();

    let summary = sentences
        .iter()
        .take(max_sentences)
        .copied()
        .collect::<Vec<_>>()
        .join(" ");

    json!({
        "summary": summary,
        "sentences": sentences.len(),
        "words": text.split_whitespace().count(),
        "truncated": sentences.len() > max_sentences,
    })
}

#[async_trait]
impl ToolHandler for SummarizeDocument {
    async fn handle(&self, arguments: Value) -> Result<Value, HandlerFailure> {
        let params: SummarizeParams = parse_arguments(arguments)?;

        let text = match (params.document_content, params.path) {
            (Some(content), _) => content,
            (None, Some(path)) => tokio::fs::read_to_string(&path)
                .await
                .map_err(|err| HandlerFailure::new(format!("failed to read {path}: {err}")))?,
            (None, None) => {
                return Err(HandlerFailure::new(
                    "either document_content or path is required",
                ))
            }
        };

        if text.trim().is_empty() {
            return Err(HandlerFailure::new("document is empty"));
        }

        Ok(summarize(&text, SUMMARY_SENTENCES))
    }
}

pub struct CompareDocuments;

#[derive(Debug, Deserialize)]
struct CompareParams {
    document_content: String,
    truthdoc_content: String,
}

impl CompareDocuments {
    pub fn descriptor() -> ToolDescriptor {
        ToolDescriptor::new(
            "compare_documents",
            json!({
                "type": "object",
                "required": ["document_content", "truthdoc_content"],
                "properties": {
                    "document_content": {
                        "type": "string",
                        "description": "The content of the document to analyze"
                    },
                    "truthdoc_content": {
                        "type": "string",
                        "description": "The verified document that document_content is compared to"
                    }
                }
            }),
        )
        .with_description("Compare a document to a verified version and report differing values")
    }
}

pub fn compare(document: &str, truth: &str) -> Value {
    let numbers = |text: &str| -> Vec<String> {
        number_pattern()
            .find_iter(text)
            .map(|found| found.as_str().replace(',', ""))
            .collect()
    };
    let document_numbers = numbers(document);
    let truth_numbers = numbers(truth);

    let numeric_differences: Vec<Value> = document_numbers
        .iter()
        .zip(truth_numbers.iter())
        .enumerate()
        .filter(|(_, (found, expected))| found != expected)
        .map(|(position, (found, expected))| {
            json!({"position": position, "document": found, "truth": expected})
        })
        .collect();

    let lines = |text: &str| -> BTreeSet<String> {
        text.lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .map(str::to_string)
            .collect()
    };
    let document_lines = lines(document);
    let truth_lines = lines(truth);

    let only_in_document: Vec<&String> = document_lines.difference(&truth_lines).collect();
    let only_in_truth: Vec<&String> = truth_lines.difference(&document_lines).collect();

    json!({
        "identical": document.trim() == truth.trim(),
        "numeric_differences": numeric_differences,
        "number_count_mismatch": document_numbers.len() != truth_numbers.len(),
        "only_in_document": only_in_document,
        "only_in_truth": only_in_truth,
    })
}

#[async_trait]
impl ToolHandler for CompareDocuments {
    async fn handle(&self, arguments: Value) -> Result<Value, HandlerFailure> {
        let params: CompareParams = parse_arguments(arguments)?;
        Ok(compare(&params.document_content, &params.truthdoc_content))
    }
}

pub struct TestRegex;

#[derive(Debug, Deserialize)]
struct TestRegexParams {
    regex_pattern: String,
    text_to_search: String,
    answer_text: String,
}

impl TestRegex {
    pub fn descriptor() -> ToolDescriptor {
        ToolDescriptor::new(
            "test_regex",
            json!({
                "type": "object",
                "required": ["regex_pattern", "text_to_search", "answer_text"],
                "properties": {
                    "regex_pattern": {"type": "string", "description": "The regex pattern to test"},
                    "text_to_search": {"type": "string", "description": "The text to search"},
                    "answer_text": {"type": "string", "description": "The answer text to verify against"}
                }
            }),
        )
        .with_description(
            "Test a regex pattern on text and verify the first match against the answer text",
        )
    }
}

#[async_trait]
impl ToolHandler for TestRegex {
    async fn handle(&self, arguments: Value) -> Result<Value, HandlerFailure> {
        let params: TestRegexParams = parse_arguments(arguments)?;
        let pattern = Regex::new(&params.regex_pattern)
            .map_err(|err| HandlerFailure::new(format!("invalid regex pattern: {err}")))?;

        let matched = pattern
            .find(&params.text_to_search)
            .map(|found| found.as_str().to_string());
        let verified = matched.as_deref() == Some(params.answer_text.as_str());

        Ok(json!({
            "matched": matched,
            "verified": verified,
            "message": if verified {
                "Regex pattern found in text"
            } else {
                "Regex pattern not found in text"
            },
        }))
    }
}
