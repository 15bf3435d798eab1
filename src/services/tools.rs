//! Tool categories and typed tool calls
//!
//! Tool payloads arrive as `(name, JSON arguments)` from whatever executes
//! them. They are decoded into [`ToolCall`] once, at the boundary, and carried
//! as typed values from then on.

use crate::error::{Result, RuntimeError};
use serde::{Deserialize, Serialize};

/// Coarse tool category used by capability scoring
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolCategory {
    Search,
    Code,
    File,
    Database,
}

impl ToolCategory {
    pub const ALL: [ToolCategory; 4] = [
        ToolCategory::Search,
        ToolCategory::Code,
        ToolCategory::File,
        ToolCategory::Database,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ToolCategory::Search => "search",
            ToolCategory::Code => "code",
            ToolCategory::File => "file",
            ToolCategory::Database => "database",
        }
    }

    /// Substrings in a message that suggest this category is needed
    pub fn triggers(&self) -> &'static [&'static str] {
        match self {
            ToolCategory::Search => &["search", "look up", "latest", "news", "搜索", "查找", "最新"],
            ToolCategory::Code => &["code", "program", "function", "script", "代码", "编程", "函数"],
            ToolCategory::File => &["file", "document", "upload", "文件", "文档"],
            ToolCategory::Database => &["database", "sql", "table", "数据库", "查询"],
        }
    }

    /// Category a tool name belongs to, if any
    pub fn from_tool_name(name: &str) -> Option<Self> {
        let lower = name.to_lowercase();
        let aliases: [(ToolCategory, &[&str]); 4] = [
            (ToolCategory::Search, &["search", "web", "browse"]),
            (ToolCategory::Code, &["code", "exec", "python", "shell"]),
            (ToolCategory::File, &["file", "fs", "read", "write"]),
            (ToolCategory::Database, &["database", "db", "sql"]),
        ];

        aliases
            .iter()
            .find(|(_, words)| words.iter().any(|w| lower.contains(w)))
            .map(|(category, _)| *category)
    }
}

impl std::fmt::Display for ToolCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// File operation requested by a file tool call
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FileOperation {
    Read,
    Write,
    List,
}

/// A validated tool call
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "tool", rename_all = "snake_case")]
pub enum ToolCall {
    Search {
        query: String,
    },
    Code {
        #[serde(default)]
        language: Option<String>,
        source: String,
    },
    File {
        path: String,
        #[serde(default = "default_file_operation")]
        operation: FileOperation,
    },
    Database {
        query: String,
    },
}

fn default_file_operation() -> FileOperation {
    FileOperation::Read
}

impl ToolCall {
    /// Decode a raw tool call
    ///
    /// The tool name selects the variant, the arguments must be a JSON object
    /// with the variant's fields, and required text fields must be non-empty.
    pub fn decode(name: &str, args: serde_json::Value) -> Result<Self> {
        let category = ToolCategory::from_tool_name(name)
            .ok_or_else(|| RuntimeError::InvalidToolCall(format!("unknown tool: {}", name)))?;

        let mut object = match args {
            serde_json::Value::Object(map) => map,
            serde_json::Value::Null => serde_json::Map::new(),
            other => {
                return Err(RuntimeError::InvalidToolCall(format!(
                    "{}: arguments must be an object, got {}",
                    name, other
                )))
            }
        };
        object.insert(
            "tool".to_string(),
            serde_json::Value::String(category.as_str().to_string()),
        );

        let call: ToolCall = serde_json::from_value(serde_json::Value::Object(object))
            .map_err(|e| RuntimeError::InvalidToolCall(format!("{}: {}", name, e)))?;
        call.validate()?;
        Ok(call)
    }

    fn validate(&self) -> Result<()> {
        let (field, value) = match self {
            ToolCall::Search { query } => ("query", query),
            ToolCall::Code { source, .. } => ("source", source),
            ToolCall::File { path, .. } => ("path", path),
            ToolCall::Database { query } => ("query", query),
        };
        if value.trim().is_empty() {
            return Err(RuntimeError::InvalidToolCall(format!(
                "{}: {} must not be empty",
                self.category(),
                field
            )));
        }
        Ok(())
    }

    pub fn category(&self) -> ToolCategory {
        match self {
            ToolCall::Search { .. } => ToolCategory::Search,
            ToolCall::Code { .. } => ToolCategory::Code,
            ToolCall::File { .. } => ToolCategory::File,
            ToolCall::Database { .. } => ToolCategory::Database,
        }
    }
}
