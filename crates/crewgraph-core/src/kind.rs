//! Closed registry of semantic payload kinds.
//!
//! Every payload that crosses a channel carries a [`Kind`]. Kinds are written
//! as `category/name` (for example `summary/text` or `diagnostic/build`) and
//! accept a set of aliases (`md`, `py`, `tool_error`, ...). The alias table is
//! built once on first use.

use crate::error::{CrewError, CrewResult};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::str::FromStr;
use std::sync::OnceLock;

/// A semantic data kind from the type registry.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(try_from = "String", into = "String")]
pub enum Kind {
    /// `primitive/string`
    PrimitiveString,
    /// `primitive/int`
    PrimitiveInt,
    /// `primitive/float`
    PrimitiveFloat,
    /// `primitive/number`
    PrimitiveNumber,
    /// `primitive/bool`
    PrimitiveBool,
    /// `primitive/null`
    PrimitiveNull,
    /// `text/plain`
    TextPlain,
    /// `text/markdown`
    TextMarkdown,
    /// `text/path`
    TextPath,
    /// `text/prompt`
    TextPrompt,
    /// `text/diff`
    TextDiff,
    /// `code/go`
    CodeGo,
    /// `code/ts`
    CodeTs,
    /// `code/js`
    CodeJs,
    /// `code/tsx`
    CodeTsx,
    /// `code/jsx`
    CodeJsx,
    /// `code/python`
    CodePython,
    /// `code/rust`
    CodeRust,
    /// `code/java`
    CodeJava,
    /// `code/c`
    CodeC,
    /// `code/cpp`
    CodeCpp,
    /// `code/bash`
    CodeBash,
    /// `code/sql`
    CodeSql,
    /// `code/yaml`
    CodeYaml,
    /// `code/toml`
    CodeToml,
    /// `json/value`
    JsonValue,
    /// `json/object`
    JsonObject,
    /// `json/array`
    JsonArray,
    /// `data/csv`
    DataCsv,
    /// `data/table`
    DataTable,
    /// `contract/openapi`
    ContractOpenapi,
    /// `contract/json-schema`
    ContractJsonSchema,
    /// `db/schema`
    DbSchema,
    /// `db/migration`
    DbMigration,
    /// `backend/route`
    BackendRoute,
    /// `backend/controller`
    BackendController,
    /// `backend/service`
    BackendService,
    /// `backend/repository`
    BackendRepository,
    /// `frontend/page`
    FrontendPage,
    /// `frontend/component`
    FrontendComponent,
    /// `frontend/form`
    FrontendForm,
    /// `frontend/client-api`
    FrontendClientApi,
    /// `artifact/ref`
    ArtifactRef,
    /// `artifact/blob`
    ArtifactBlob,
    /// `artifact/summary`
    ArtifactSummary,
    /// `tool/result`
    ToolResult,
    /// `tool/error`
    ToolError,
    /// `capability/tools`
    CapabilityTools,
    /// `plan/task`
    PlanTask,
    /// `plan/summary`
    PlanSummary,
    /// `diagnostic/lint`
    DiagnosticLint,
    /// `diagnostic/test`
    DiagnosticTest,
    /// `diagnostic/build`
    DiagnosticBuild,
    /// `memory/fact`
    MemoryFact,
    /// `memory/question`
    MemoryQuestion,
    /// `memory/summary`
    MemorySummary,
    /// `message/user`
    MessageUser,
    /// `message/agent`, the kind of untyped agent handoffs.
    #[default]
    MessageAgent,
    /// `message/assistant`
    MessageAssistant,
    /// `message/system`
    MessageSystem,
    /// `message/tool`
    MessageTool,
    /// `summary/code`
    SummaryCode,
    /// `summary/text`
    SummaryText,
    /// `summary/api`
    SummaryApi,
    /// `test/unit`
    TestUnit,
    /// `test/integration`
    TestIntegration,
    /// `test/e2e`
    TestE2e,
    /// `context/compiled`
    ContextCompiled,
}

/// Registry entry describing one [`Kind`].
#[derive(Debug, Clone, Copy)]
pub struct KindDef {
    /// The kind this entry describes.
    pub kind: Kind,
    /// Canonical `category/name` tag.
    pub name: &'static str,
    /// Human-readable description.
    pub description: &'static str,
    /// Accepted alternative spellings.
    pub aliases: &'static [&'static str],
}

const fn def(
    kind: Kind,
    name: &'static str,
    description: &'static str,
    aliases: &'static [&'static str],
) -> KindDef {
    KindDef {
        kind,
        name,
        description,
        aliases,
    }
}

// Ordered by enum discriminant; `Kind::def` indexes into this table.
static DEFS: [KindDef; 68] = [
    def(Kind::PrimitiveString, "primitive/string", "String scalar value.", &["string", "str"]),
    def(Kind::PrimitiveInt, "primitive/int", "Integer scalar value.", &["int", "integer"]),
    def(Kind::PrimitiveFloat, "primitive/float", "Float scalar value.", &["float"]),
    def(Kind::PrimitiveNumber, "primitive/number", "Generic numeric scalar.", &["number", "num"]),
    def(Kind::PrimitiveBool, "primitive/bool", "Boolean scalar value.", &["bool", "boolean"]),
    def(Kind::PrimitiveNull, "primitive/null", "Null or empty scalar.", &["null", "nil"]),
    def(Kind::TextPlain, "text/plain", "Plain text content.", &["text", "plain", "string/text"]),
    def(Kind::TextMarkdown, "text/markdown", "Markdown text.", &["md", "markdown"]),
    def(Kind::TextPath, "text/path", "Filesystem path as text.", &["path", "filepath"]),
    def(Kind::TextPrompt, "text/prompt", "Prompt or instruction text.", &["prompt"]),
    def(Kind::TextDiff, "text/diff", "Patch or diff text.", &["diff", "patch"]),
    def(Kind::CodeGo, "code/go", "Go source code.", &["go", "code.go"]),
    def(Kind::CodeTs, "code/ts", "TypeScript source code.", &["ts", "typescript", "code.ts"]),
    def(Kind::CodeJs, "code/js", "JavaScript source code.", &["js", "javascript", "code.js"]),
    def(Kind::CodeTsx, "code/tsx", "TypeScript JSX source code.", &["tsx", "code.tsx"]),
    def(Kind::CodeJsx, "code/jsx", "JavaScript JSX source code.", &["jsx", "code.jsx"]),
    def(Kind::CodePython, "code/python", "Python source code.", &["py", "python", "code.py"]),
    def(Kind::CodeRust, "code/rust", "Rust source code.", &["rs", "rust", "code.rs"]),
    def(Kind::CodeJava, "code/java", "Java source code.", &["java", "code.java"]),
    def(Kind::CodeC, "code/c", "C source or header code.", &["c", "code.c"]),
    def(Kind::CodeCpp, "code/cpp", "C++ source or header code.", &["cpp", "cc", "cxx", "hpp", "code.cpp"]),
    def(Kind::CodeBash, "code/bash", "Shell script code.", &["sh", "bash", "zsh", "shell", "code.sh"]),
    def(Kind::CodeSql, "code/sql", "SQL code or query.", &["sql", "code.sql"]),
    def(Kind::CodeYaml, "code/yaml", "YAML document or config.", &["yaml", "yml", "code.yaml"]),
    def(Kind::CodeToml, "code/toml", "TOML document or config.", &["toml", "code.toml"]),
    def(Kind::JsonValue, "json/value", "Generic JSON value.", &["json", "code.json"]),
    def(Kind::JsonObject, "json/object", "JSON object.", &["json.object"]),
    def(Kind::JsonArray, "json/array", "JSON array.", &["json.array"]),
    def(Kind::DataCsv, "data/csv", "CSV tabular data.", &["csv", "data.csv"]),
    def(Kind::DataTable, "data/table", "Logical tabular data.", &["table", "tabular"]),
    def(Kind::ContractOpenapi, "contract/openapi", "OpenAPI contract.", &["openapi", "api_contract"]),
    def(
        Kind::ContractJsonSchema,
        "contract/json-schema",
        "JSON Schema contract for API or domain payloads.",
        &["json-schema", "jsonschema", "contract.jsonschema"],
    ),
    def(Kind::DbSchema, "db/schema", "Database schema definition.", &["schema", "database.schema"]),
    def(Kind::DbMigration, "db/migration", "Database migration.", &["migration", "database.migration"]),
    def(Kind::BackendRoute, "backend/route", "Backend route registration layer.", &["route", "routes"]),
    def(Kind::BackendController, "backend/controller", "Backend controller layer.", &["controller", "controllers"]),
    def(Kind::BackendService, "backend/service", "Backend service layer.", &["service", "services"]),
    def(Kind::BackendRepository, "backend/repository", "Backend data-access layer.", &["repository", "repo"]),
    def(Kind::FrontendPage, "frontend/page", "Frontend page entrypoint.", &["page"]),
    def(Kind::FrontendComponent, "frontend/component", "Frontend UI component.", &["component", "components"]),
    def(Kind::FrontendForm, "frontend/form", "Frontend form flow.", &["form"]),
    def(Kind::FrontendClientApi, "frontend/client-api", "Frontend API client layer.", &["client-api"]),
    def(Kind::ArtifactRef, "artifact/ref", "Reference to a stored artifact.", &["artifact", "ref"]),
    def(Kind::ArtifactBlob, "artifact/blob", "Opaque binary artifact.", &["blob"]),
    def(Kind::ArtifactSummary, "artifact/summary", "Summary of artifact content.", &[]),
    def(Kind::ToolResult, "tool/result", "Structured tool execution result.", &[]),
    def(Kind::ToolError, "tool/error", "Structured tool execution error.", &[]),
    def(Kind::CapabilityTools, "capability/tools", "Tool capability descriptor.", &["tools", "toolset"]),
    def(Kind::PlanTask, "plan/task", "Task step description.", &["task"]),
    def(Kind::PlanSummary, "plan/summary", "Plan summary.", &["plan"]),
    def(Kind::DiagnosticLint, "diagnostic/lint", "Lint diagnostics.", &["lint"]),
    def(Kind::DiagnosticTest, "diagnostic/test", "Test diagnostics.", &["test_result"]),
    def(Kind::DiagnosticBuild, "diagnostic/build", "Build diagnostics.", &["build_result"]),
    def(Kind::MemoryFact, "memory/fact", "Persisted fact item.", &["fact"]),
    def(Kind::MemoryQuestion, "memory/question", "Open question tracked in memory.", &["question"]),
    def(Kind::MemorySummary, "memory/summary", "Persisted summary memory.", &[]),
    def(Kind::MessageUser, "message/user", "User message payload.", &["msg.user", "user_message"]),
    def(Kind::MessageAgent, "message/agent", "Agent-to-agent message payload.", &["msg.agent", "agent_message"]),
    def(
        Kind::MessageAssistant,
        "message/assistant",
        "Assistant message payload.",
        &["msg.assistant", "assistant_message"],
    ),
    def(Kind::MessageSystem, "message/system", "System message payload.", &["msg.system", "system_message"]),
    def(Kind::MessageTool, "message/tool", "Tool message payload.", &["msg.tool", "tool_message"]),
    def(Kind::SummaryCode, "summary/code", "Compressed summary of code.", &["code_summary"]),
    def(Kind::SummaryText, "summary/text", "Compressed summary of text.", &["text_summary"]),
    def(Kind::SummaryApi, "summary/api", "Compressed summary of an API contract.", &["api_summary"]),
    def(Kind::TestUnit, "test/unit", "Unit test code or plan.", &["unit_test"]),
    def(Kind::TestIntegration, "test/integration", "Integration test code or plan.", &["integration_test"]),
    def(Kind::TestE2e, "test/e2e", "End-to-end test code or plan.", &["e2e_test"]),
    def(
        Kind::ContextCompiled,
        "context/compiled",
        "Compiled context window emitted by the context compiler.",
        &["compiled_context"],
    ),
];

fn normalize(raw: &str) -> String {
    raw.trim()
        .to_lowercase()
        .replace(['_', '.'], "/")
        .replace(' ', "")
}

fn alias_table() -> &'static HashMap<String, Kind> {
    static TABLE: OnceLock<HashMap<String, Kind>> = OnceLock::new();
    TABLE.get_or_init(|| {
        let mut table = HashMap::new();
        for d in Kind::defs() {
            table.insert(normalize(d.name), d.kind);
            for alias in d.aliases {
                table.insert(normalize(alias), d.kind);
            }
        }
        table
    })
}

impl Kind {
    /// Iterate over every registry entry in declaration order.
    pub fn defs() -> impl Iterator<Item = &'static KindDef> {
        DEFS.iter()
    }

    /// Every kind in the registry.
    pub fn all() -> Vec<Kind> {
        Self::defs().map(|d| d.kind).collect()
    }

    /// Registry entry for this kind.
    pub fn def(self) -> &'static KindDef {
        &DEFS[self as usize]
    }

    /// Resolve a raw tag or alias to its canonical kind.
    pub fn resolve(raw: &str) -> Option<Kind> {
        let key = normalize(raw);
        if key.is_empty() {
            return None;
        }
        alias_table().get(&key).copied()
    }

    /// Canonical `category/name` tag.
    pub fn as_str(self) -> &'static str {
        self.def().name
    }

    /// Category prefix (the part before `/`).
    pub fn category(self) -> &'static str {
        let name = self.as_str();
        name.split_once('/').map(|(cat, _)| cat).unwrap_or(name)
    }

    /// Human-readable description.
    pub fn description(self) -> &'static str {
        self.def().description
    }

    /// Whether a payload of this kind can feed a port accepting `accepted`.
    ///
    /// Equal kinds always match. `message/agent` and `text/plain` are
    /// interchangeable, and `artifact/ref` transports any `artifact/*`.
    pub fn satisfies(self, accepted: Kind) -> bool {
        if self == accepted {
            return true;
        }
        match (self, accepted) {
            (Kind::MessageAgent, Kind::TextPlain) | (Kind::TextPlain, Kind::MessageAgent) => true,
            (Kind::ArtifactRef, other) => other.category() == "artifact",
            _ => false,
        }
    }

    /// Whether this kind can be rendered as plain conversational text.
    pub fn is_message_like(self) -> bool {
        matches!(self, Kind::MessageAgent | Kind::TextPlain | Kind::TextMarkdown)
    }

    /// Infer a kind from a file path extension. Unknown extensions map to `text/plain`.
    pub fn infer_from_path(path: &str) -> Kind {
        let ext = std::path::Path::new(path)
            .extension()
            .and_then(|e| e.to_str())
            .map(str::to_lowercase)
            .unwrap_or_default();
        match ext.as_str() {
            "go" => Kind::CodeGo,
            "ts" => Kind::CodeTs,
            "js" => Kind::CodeJs,
            "tsx" => Kind::CodeTsx,
            "jsx" => Kind::CodeJsx,
            "py" => Kind::CodePython,
            "rs" => Kind::CodeRust,
            "java" => Kind::CodeJava,
            "c" | "h" => Kind::CodeC,
            "cc" | "cpp" | "cxx" | "hpp" | "hh" => Kind::CodeCpp,
            "sh" | "bash" | "zsh" => Kind::CodeBash,
            "sql" => Kind::CodeSql,
            "yaml" | "yml" => Kind::CodeYaml,
            "toml" => Kind::CodeToml,
            "json" => Kind::JsonValue,
            "csv" => Kind::DataCsv,
            "md" | "markdown" => Kind::TextMarkdown,
            "diff" | "patch" => Kind::TextDiff,
            _ => Kind::TextPlain,
        }
    }
}

/// Sorted list of distinct categories in the registry.
pub fn categories() -> Vec<&'static str> {
    Kind::defs()
        .map(|d| d.kind.category())
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect()
}

impl fmt::Display for Kind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Kind {
    type Err = CrewError;

    fn from_str(s: &str) -> CrewResult<Self> {
        Kind::resolve(s).ok_or_else(|| CrewError::UnknownKind(s.trim().to_string()))
    }
}

impl TryFrom<String> for Kind {
    type Error = CrewError;

    fn try_from(value: String) -> CrewResult<Self> {
        value.parse()
    }
}

impl From<Kind> for String {
    fn from(kind: Kind) -> Self {
        kind.as_str().to_string()
    }
}
