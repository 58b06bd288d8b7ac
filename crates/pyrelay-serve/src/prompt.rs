use pyrelay_core::Trigger;
use serde_json::Value;

/// LLM prompt, one variant per template.
#[derive(Debug, Clone, PartialEq)]
pub enum Prompt {
    Explain {
        code: String,
        filename: Option<String>,
    },
    /// Code about to be executed.
    Debug {
        code: String,
        filename: Option<String>,
    },
    /// A noteworthy output line from a running script.
    RuntimeAnalysis {
        code: String,
        context: Value,
    },
    Comparison {
        code_a: String,
        code_b: String,
    },
}

impl Prompt {
    /// Template for an analyze job submitted with `trigger`.
    pub fn for_trigger(
        trigger: Trigger,
        code: &str,
        filename: Option<&str>,
        context: Option<Value>,
    ) -> Self {
        let code = code.to_string();
        let filename = filename.map(str::to_string);
        match trigger {
            Trigger::Run => Prompt::Debug { code, filename },
            Trigger::Runtime => Prompt::RuntimeAnalysis {
                code,
                context: context.unwrap_or_else(|| Value::Object(Default::default())),
            },
            Trigger::Manual
            | Trigger::Upload
            | Trigger::Save
            | Trigger::Created
            | Trigger::Modified
            | Trigger::Other => Prompt::Explain { code, filename },
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Prompt::Explain { .. } => "explain",
            Prompt::Debug { .. } => "debug",
            Prompt::RuntimeAnalysis { .. } => "runtime_analysis",
            Prompt::Comparison { .. } => "comparison",
        }
    }

    pub fn render(&self) -> String {
        match self {
            Prompt::Explain { code, filename } => format!(
                "You are a Python code reviewer. Explain what the following code{} does, \
                 point out bugs or risky constructs, and suggest concrete improvements.\n\n\
                 ```python\n{code}\n```",
                file_suffix(filename.as_deref())
            ),
            Prompt::Debug { code, filename } => format!(
                "The following Python code{} is about to be executed. Predict its output, \
                 list any errors it is likely to raise, and explain how to fix them.\n\n\
                 ```python\n{code}\n```",
                file_suffix(filename.as_deref())
            ),
            Prompt::RuntimeAnalysis { code, context } => {
                let context = serde_json::to_string_pretty(context).unwrap_or_default();
                format!(
                    "A Python script produced the output described below while running. \
                     Interpret the highlighted line in light of the recent output and the \
                     source, and say whether it indicates a problem.\n\n\
                     Runtime context:\n```json\n{context}\n```\n\n\
                     Source:\n```python\n{code}\n```"
                )
            }
            Prompt::Comparison { code_a, code_b } => format!(
                "Compare the two Python snippets below. Describe their behavioural \
                 differences, then compare readability and performance, and say which \
                 one you would keep.\n\n\
                 Snippet A:\n```python\n{code_a}\n```\n\n\
                 Snippet B:\n```python\n{code_b}\n```"
            ),
        }
    }
}

fn file_suffix(filename: Option<&str>) -> String {
    match filename {
        Some(name) if !name.is_empty() => format!(" (from `{name}`)"),
        _ => String::new(),
    }
}
