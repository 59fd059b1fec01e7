//! Prompt templates and the message builder.

use std::collections::BTreeMap;

use serde::Serialize;

/// A chat message in provider-neutral form.
#[derive(Debug, Clone, Serialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: "system".to_string(),
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user".to_string(),
            content: content.into(),
        }
    }
}

/// Prompt families. Only RAG generation is wired today; the enum keeps the
/// template table open for summarization and chat variants.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PromptKind {
    RagGeneration,
}

struct PromptTemplate {
    system: &'static str,
    user: &'static str,
}

const RAG_GENERATION: PromptTemplate = PromptTemplate {
    system: "You are an AI assistant that answers questions strictly based on the retrieved context provided.
Do not use outside knowledge or make assumptions beyond this context.
If the context does not contain enough information to answer, clearly say so.
Always respond in a clear, concise, and professional manner.",
    user: "Context:
{context}

Question:
{query}

Instructions:
- Use only the information from the context above.
- If the answer is not explicitly present, respond with \"The provided context does not contain enough information to answer.\"
- For every sentence or paragraph that uses information from a specific chunk, indicate the corresponding chunk number in square brackets right after it. Example:
  \"IAM allows defining permissions for users and resources. [1]\"
- If multiple chunks support the same sentence, list them together: \"[1, 3]\".
- Do not list chunks that were not actually used.
- Do not include references to these instructions or the word 'context' in your answer.
- Write in clear, concise, and professional language.

Answer:",
};

/// Builds role-tagged messages from a template and interpolated variables.
pub struct PromptBuilder {
    kind: PromptKind,
    variables: BTreeMap<String, String>,
}

impl PromptBuilder {
    pub fn new(kind: PromptKind) -> Self {
        Self {
            kind,
            variables: BTreeMap::new(),
        }
    }

    /// Add a variable to interpolate; `{key}` occurrences in the user
    /// template are replaced by the value.
    pub fn variable(mut self, key: &str, value: impl Into<String>) -> Self {
        self.variables.insert(key.to_string(), value.into());
        self
    }

    pub fn build_messages(self) -> Vec<ChatMessage> {
        let template = match self.kind {
            PromptKind::RagGeneration => &RAG_GENERATION,
        };

        let mut user = template.user.to_string();
        for (key, value) in &self.variables {
            user = user.replace(&format!("{{{}}}", key), value);
        }

        let mut messages = Vec::with_capacity(2);
        if !template.system.is_empty() {
            messages.push(ChatMessage::system(template.system));
        }
        messages.push(ChatMessage::user(user));
        messages
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builds_system_and_user_messages() {
        let messages = PromptBuilder::new(PromptKind::RagGeneration)
            .variable("context", "[Chunk number 1 - a.pdf (page 1) - distance: 0.120]\nIAM basics\n")
            .variable("query", "What is IAM?")
            .build_messages();

        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].role, "system");
        assert_eq!(messages[1].role, "user");
        assert!(messages[1].content.contains("IAM basics"));
        assert!(messages[1].content.contains("What is IAM?"));
        assert!(!messages[1].content.contains("{context}"));
        assert!(!messages[1].content.contains("{query}"));
    }

    #[test]
    fn template_demands_bracketed_citations() {
        let messages = PromptBuilder::new(PromptKind::RagGeneration)
            .variable("context", "c")
            .variable("query", "q")
            .build_messages();
        assert!(messages[1].content.contains("square brackets"));
        assert!(messages[1].content.contains("[1, 3]"));
    }
}
