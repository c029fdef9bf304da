//! Prompt templates for translation operations.
//!
//! One template per (operation, detail level) pair. Each declares the
//! context variables it interpolates; rendering with a required variable
//! missing is a `TemplateError` raised before any network traffic, so a
//! broken call never costs tokens.

use std::collections::HashMap;
use thiserror::Error;

use crate::model::TranslationDetail;

#[derive(Debug, Error)]
pub enum TemplateError {
    #[error("prompt template for {operation} is missing variable {variable}")]
    MissingVariable {
        operation: &'static str,
        variable: &'static str,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    FunctionTranslation,
    ImportExplanation,
    StringInterpretation,
    OverallSummary,
}

impl Operation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Operation::FunctionTranslation => "function_translation",
            Operation::ImportExplanation => "import_explanation",
            Operation::StringInterpretation => "string_interpretation",
            Operation::OverallSummary => "overall_summary",
        }
    }
}

pub struct PromptTemplate {
    pub operation: Operation,
    pub system: &'static str,
    body: &'static str,
    required: &'static [&'static str],
}

#[derive(Debug, Clone)]
pub struct RenderedPrompt {
    pub system: String,
    pub user: String,
}

const ANALYST_SYSTEM: &str = "You are a reverse-engineering analyst. You read disassembled \
binaries and explain them in plain language for software engineers who have never opened a \
disassembler. Be concrete about what the code does; say so plainly when something cannot be \
determined from the given material. Respond with JSON only, no prose around it.";

const FUNCTION_REQUIRED: &[&str] = &["name", "address", "size", "assembly"];
const IMPORT_REQUIRED: &[&str] = &["library", "functions"];
const STRING_REQUIRED: &[&str] = &["format", "strings"];
const SUMMARY_REQUIRED: &[&str] = &["format", "platform", "architecture", "function_count"];

static FUNCTION_BRIEF: PromptTemplate = PromptTemplate {
    operation: Operation::FunctionTranslation,
    system: ANALYST_SYSTEM,
    body: "Explain the disassembled function below in one or two sentences.\n\
Function name: {name}\nAddress: {address}\nSize: {size} bytes\n\
Calls: {calls}\nImports referenced: {imports}\n\
Assembly:\n{assembly}\n\n\
State the function's purpose only; skip instruction-level detail.\n\
Return JSON: {\"summary\": \"...\"}",
    required: FUNCTION_REQUIRED,
};

static FUNCTION_STANDARD: PromptTemplate = PromptTemplate {
    operation: Operation::FunctionTranslation,
    system: ANALYST_SYSTEM,
    body: "Explain the disassembled function below.\n\
Function name: {name}\nAddress: {address}\nSize: {size} bytes\n\
Calls: {calls}\nImports referenced: {imports}\n\
Assembly:\n{assembly}\n\n\
Summarize the purpose in a short paragraph, then describe notable behavior: loops, error \
handling, calls into other functions or imported APIs, and any data it appears to read or \
write.\n\
Return JSON: {\"summary\": \"...\", \"behavior\": \"...\"}",
    required: FUNCTION_REQUIRED,
};

static FUNCTION_COMPREHENSIVE: PromptTemplate = PromptTemplate {
    operation: Operation::FunctionTranslation,
    system: ANALYST_SYSTEM,
    body: "Produce a thorough explanation of the disassembled function below.\n\
Function name: {name}\nAddress: {address}\nSize: {size} bytes\n\
Calls: {calls}\nImports referenced: {imports}\n\
Assembly:\n{assembly}\n\n\
Cover, in depth: the function's purpose; its control flow (branches, loops, early exits); \
apparent parameters and return value; side effects on memory, files, network or registry; \
interactions with the listed imports; and anything security-relevant such as unchecked \
copies, raw pointer arithmetic, or privilege-sensitive APIs. Distinguish what the assembly \
shows from what you are inferring.\n\
Return JSON: {\"summary\": \"...\", \"behavior\": \"...\"}",
    required: FUNCTION_REQUIRED,
};

static IMPORT_BRIEF: PromptTemplate = PromptTemplate {
    operation: Operation::ImportExplanation,
    system: ANALYST_SYSTEM,
    body: "A binary imports these functions from {library}:\n{functions}\n\n\
In one sentence, say what this library is used for in this program.\n\
Return JSON: {\"explanation\": \"...\"}",
    required: IMPORT_REQUIRED,
};

static IMPORT_STANDARD: PromptTemplate = PromptTemplate {
    operation: Operation::ImportExplanation,
    system: ANALYST_SYSTEM,
    body: "A binary imports these functions from {library}:\n{functions}\n\n\
Explain what this library provides and what the listed functions, taken together, suggest \
about the program's behavior.\n\
Return JSON: {\"explanation\": \"...\"}",
    required: IMPORT_REQUIRED,
};

static IMPORT_COMPREHENSIVE: PromptTemplate = PromptTemplate {
    operation: Operation::ImportExplanation,
    system: ANALYST_SYSTEM,
    body: "A binary imports these functions from {library}:\n{functions}\n\n\
Explain the library itself, then each listed function and its typical use. Close with what \
this particular combination of imports implies about the program's capabilities — for \
example networking, persistence, process manipulation, or cryptography — and note any \
function that is unusual to see alongside the others.\n\
Return JSON: {\"explanation\": \"...\"}",
    required: IMPORT_REQUIRED,
};

static STRING_BRIEF: PromptTemplate = PromptTemplate {
    operation: Operation::StringInterpretation,
    system: ANALYST_SYSTEM,
    body: "Interpret these strings extracted from a {format} binary. They are listed as \
index, address, value:\n{strings}\n\n\
Give one short phrase per string naming its likely role (path, URL, format string, \
registry key, error message, and so on).\n\
Return JSON: {\"interpretations\": [{\"index\": 0, \"meaning\": \"...\"}, ...]} with one \
entry per input string, in the same order.",
    required: STRING_REQUIRED,
};

static STRING_STANDARD: PromptTemplate = PromptTemplate {
    operation: Operation::StringInterpretation,
    system: ANALYST_SYSTEM,
    body: "Interpret these strings extracted from a {format} binary. They are listed as \
index, address, value:\n{strings}\n\n\
For each string, give one sentence on its likely role in the program.\n\
Return JSON: {\"interpretations\": [{\"index\": 0, \"meaning\": \"...\"}, ...]} with one \
entry per input string, in the same order.",
    required: STRING_REQUIRED,
};

static STRING_COMPREHENSIVE: PromptTemplate = PromptTemplate {
    operation: Operation::StringInterpretation,
    system: ANALYST_SYSTEM,
    body: "Interpret these strings extracted from a {format} binary. They are listed as \
index, address, value:\n{strings}\n\n\
For each string, explain its likely role and what it reveals about the program: \
configuration it reads, protocols or endpoints it speaks to, file and registry locations \
it touches, embedded resources, or user-facing text. Group-level observations belong in \
the individual entries they arise from.\n\
Return JSON: {\"interpretations\": [{\"index\": 0, \"meaning\": \"...\"}, ...]} with one \
entry per input string, in the same order.",
    required: STRING_REQUIRED,
};

static SUMMARY_BRIEF: PromptTemplate = PromptTemplate {
    operation: Operation::OverallSummary,
    system: ANALYST_SYSTEM,
    body: "Summarize what this binary does overall, in three sentences at most.\n\
Format: {format} for {platform} ({architecture})\n\
Function count: {function_count}\nNotable imports: {imports}\n\
Per-function notes:\n{function_notes}\n\n\
Return JSON: {\"summary\": \"...\"}",
    required: SUMMARY_REQUIRED,
};

static SUMMARY_STANDARD: PromptTemplate = PromptTemplate {
    operation: Operation::OverallSummary,
    system: ANALYST_SYSTEM,
    body: "Summarize what this binary does overall, in one or two paragraphs.\n\
Format: {format} for {platform} ({architecture})\n\
Function count: {function_count}\nNotable imports: {imports}\n\
Per-function notes:\n{function_notes}\n\n\
Describe the program's apparent purpose and its main observable behaviors, citing the \
imports and function notes that support each claim.\n\
Return JSON: {\"summary\": \"...\"}",
    required: SUMMARY_REQUIRED,
};

static SUMMARY_COMPREHENSIVE: PromptTemplate = PromptTemplate {
    operation: Operation::OverallSummary,
    system: ANALYST_SYSTEM,
    body: "Write a thorough overview of what this binary does.\n\
Format: {format} for {platform} ({architecture})\n\
Function count: {function_count}\nNotable imports: {imports}\n\
Per-function notes:\n{function_notes}\n\n\
Cover the program's purpose, its architecture as far as the function notes reveal it, \
notable behavior (I/O, networking, persistence, concurrency), and open questions a human \
analyst should look at next. Keep claims tied to the evidence above.\n\
Return JSON: {\"summary\": \"...\"}",
    required: SUMMARY_REQUIRED,
};

pub fn template_for(operation: Operation, detail: TranslationDetail) -> &'static PromptTemplate {
    use TranslationDetail::{Brief, Comprehensive, Standard};
    match (operation, detail) {
        (Operation::FunctionTranslation, Brief) => &FUNCTION_BRIEF,
        (Operation::FunctionTranslation, Standard) => &FUNCTION_STANDARD,
        (Operation::FunctionTranslation, Comprehensive) => &FUNCTION_COMPREHENSIVE,
        (Operation::ImportExplanation, Brief) => &IMPORT_BRIEF,
        (Operation::ImportExplanation, Standard) => &IMPORT_STANDARD,
        (Operation::ImportExplanation, Comprehensive) => &IMPORT_COMPREHENSIVE,
        (Operation::StringInterpretation, Brief) => &STRING_BRIEF,
        (Operation::StringInterpretation, Standard) => &STRING_STANDARD,
        (Operation::StringInterpretation, Comprehensive) => &STRING_COMPREHENSIVE,
        (Operation::OverallSummary, Brief) => &SUMMARY_BRIEF,
        (Operation::OverallSummary, Standard) => &SUMMARY_STANDARD,
        (Operation::OverallSummary, Comprehensive) => &SUMMARY_COMPREHENSIVE,
    }
}

impl PromptTemplate {
    /// Interpolate `{variable}` placeholders. Every declared-required
    /// variable must be present; optional ones fall back to "none".
    pub fn render(
        &self,
        vars: &HashMap<&'static str, String>,
    ) -> Result<RenderedPrompt, TemplateError> {
        for required in self.required {
            if !vars.contains_key(required) {
                return Err(TemplateError::MissingVariable {
                    operation: self.operation.as_str(),
                    variable: required,
                });
            }
        }

        let mut user = self.body.to_string();
        for (name, value) in vars {
            user = user.replace(&format!("{{{name}}}"), value);
        }
        // Unfilled optional slots read as "none" rather than leaking braces.
        for optional in ["{calls}", "{imports}", "{function_notes}"] {
            user = user.replace(optional, "none");
        }

        Ok(RenderedPrompt {
            system: self.system.to_string(),
            user,
        })
    }
}
