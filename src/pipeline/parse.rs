//! Tag extraction from LLM responses.
//!
//! Stage responses wrap their payload in XML-ish tags:
//! - `<reasoning>` + `<typespec>` for the TypeSpec stage
//! - `<reasoning>` + `<drizzle>` for the schema stage
//! - `<reasoning>` + `<typescript>` for the TypeScript stage
//! - `<imports>` + one `<test>` per case for handler tests
//! - `<handler>` for handler implementations

use std::collections::BTreeSet;
use std::sync::LazyLock;

use regex::Regex;

use super::context::{
    DrizzleOutput, FunctionDeclaration, LlmFunction, TypescriptOutput, TypespecOutput,
};
use crate::errors::PipelineError;

static LLM_FUNC_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"@llm_func\("(?P<description>.+)"\)\s*(?P<name>\w+)\s*\("#).unwrap()
});

static PG_TABLE_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"export\s+const\s+(\w+)\s*=\s*pgTable").unwrap());

static DECLARE_FUNCTION_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"export\s+declare\s+function\s+(?P<name>\w+)\s*\(\s*options\s*:\s*(?P<arg>[^)]+?)\s*\)\s*:\s*(?P<ret>[^;]+?)\s*;",
    )
    .unwrap()
});

static SCHEMA_IMPORT_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?s)import\s*\{(?P<names>[^}]*)\}\s*from\s*["'](?:\.\./)+db/schema/application["']"#)
        .unwrap()
});

fn tag_regex(tag: &str) -> Regex {
    // Tags are fixed identifiers, so the pattern always compiles.
    Regex::new(&format!(r"(?s)<{tag}>(.*?)</{tag}>")).unwrap()
}

/// Trimmed content of the first `<tag>...</tag>`.
pub fn extract_tag(text: &str, tag: &str) -> Option<String> {
    tag_regex(tag)
        .captures(text)
        .and_then(|cap| cap.get(1))
        .map(|m| m.as_str().trim().to_string())
}

/// Trimmed contents of every `<tag>...</tag>`, in order.
pub fn extract_all(text: &str, tag: &str) -> Vec<String> {
    tag_regex(tag)
        .captures_iter(text)
        .filter_map(|cap| cap.get(1))
        .map(|m| m.as_str().trim().to_string())
        .collect()
}

fn require_tag(text: &str, tag: &str, what: &'static str) -> Result<String, PipelineError> {
    extract_tag(text, tag).ok_or_else(|| PipelineError::Parse {
        what,
        message: format!("expected <{tag}> tag in response"),
    })
}

pub fn parse_typespec(text: &str) -> Result<TypespecOutput, PipelineError> {
    let typespec = require_tag(text, "typespec", "TypeSpec output")?;
    let reasoning = extract_tag(text, "reasoning").unwrap_or_default();
    let llm_functions = llm_functions(&typespec);
    Ok(TypespecOutput {
        reasoning,
        typespec,
        llm_functions,
    })
}

pub fn llm_functions(typespec: &str) -> Vec<LlmFunction> {
    LLM_FUNC_REGEX
        .captures_iter(typespec)
        .map(|cap| LlmFunction {
            name: cap["name"].to_string(),
            description: cap["description"].to_string(),
        })
        .collect()
}

/// Wrap a bare TypeSpec document so it parses like an LLM response.
pub fn wrap_typespec(source: &str) -> String {
    if source.contains("<typespec>") && source.contains("</typespec>") {
        return source.to_string();
    }
    format!("<reasoning>\nProvided by the user.\n</reasoning>\n\n<typespec>\n{source}\n</typespec>")
}

pub fn parse_drizzle(text: &str) -> Result<DrizzleOutput, PipelineError> {
    let drizzle_schema = require_tag(text, "drizzle", "Drizzle schema")?;
    let reasoning = extract_tag(text, "reasoning").unwrap_or_default();
    let tables = table_names(&drizzle_schema);
    Ok(DrizzleOutput {
        reasoning,
        drizzle_schema,
        tables,
    })
}

pub fn table_names(drizzle_schema: &str) -> Vec<String> {
    PG_TABLE_REGEX
        .captures_iter(drizzle_schema)
        .map(|cap| cap[1].to_string())
        .collect()
}

pub fn parse_typescript(text: &str) -> Result<TypescriptOutput, PipelineError> {
    let typescript_schema = require_tag(text, "typescript", "TypeScript schema")?;
    let reasoning = extract_tag(text, "reasoning").unwrap_or_default();
    let functions = function_declarations(&typescript_schema);
    if functions.is_empty() {
        return Err(PipelineError::Parse {
            what: "TypeScript schema",
            message: "no `export declare function name(options: T): R;` declarations found"
                .to_string(),
        });
    }
    Ok(TypescriptOutput {
        reasoning,
        typescript_schema,
        functions,
    })
}

pub fn function_declarations(typescript: &str) -> Vec<FunctionDeclaration> {
    DECLARE_FUNCTION_REGEX
        .captures_iter(typescript)
        .map(|cap| FunctionDeclaration {
            name: cap["name"].to_string(),
            argument_type: cap["arg"].to_string(),
            return_type: cap["ret"].to_string(),
        })
        .collect()
}

/// `(imports, test cases)` from a handler test response.
pub fn parse_handler_tests(text: &str) -> Result<(String, Vec<String>), PipelineError> {
    let imports = require_tag(text, "imports", "handler tests")?;
    let tests = extract_all(text, "test");
    if tests.is_empty() {
        return Err(PipelineError::Parse {
            what: "handler tests",
            message: "expected at least one <test> tag in response".to_string(),
        });
    }
    Ok((imports, tests))
}

pub fn parse_handler(text: &str) -> Result<String, PipelineError> {
    require_tag(text, "handler", "handler")
}

/// Names imported from the Drizzle schema module that are not real tables.
pub fn unknown_table_imports(source: &str, tables: &[String]) -> Vec<String> {
    let known: BTreeSet<&str> = tables.iter().map(String::as_str).collect();
    SCHEMA_IMPORT_REGEX
        .captures_iter(source)
        .flat_map(|cap| {
            cap["names"]
                .split(',')
                .map(|n| n.trim().trim_start_matches("type ").trim())
                .filter_map(|n| n.split(" as ").next().map(str::trim))
                .filter(|n| !n.is_empty())
                .map(str::to_string)
                .collect::<Vec<_>>()
        })
        .filter(|name| !known.contains(name.as_str()))
        .collect()
}
