//! Finalization: map pipeline artifacts onto the generated server's file tree.

use std::path::Path;

use anyhow::{Context, Result};

use crate::pipeline::context::PipelineContext;
use crate::validate::FileMap;

pub const TYPESPEC_PATH: &str = "spec/main.tsp";
pub const DRIZZLE_SCHEMA_PATH: &str = "src/db/schema/application.ts";
pub const COMMON_SCHEMA_PATH: &str = "src/common/schema.ts";
pub const LOGIC_INDEX_PATH: &str = "src/logic/index.ts";
pub const LOGIC_ROUTER_PATH: &str = "src/logic/router.ts";

/// `recordDish` → `record_dish`, used for handler module and file names.
pub fn module_name(function_name: &str) -> String {
    let mut out = String::with_capacity(function_name.len() + 4);
    for (i, c) in function_name.chars().enumerate() {
        if c.is_ascii_uppercase() {
            if i > 0 {
                out.push('_');
            }
            out.push(c.to_ascii_lowercase());
        } else {
            out.push(c);
        }
    }
    out
}

pub fn handler_path(function_name: &str) -> String {
    format!("src/handlers/{}.ts", module_name(function_name))
}

pub fn handler_test_path(function_name: &str) -> String {
    format!("src/tests/handlers/{}.test.ts", module_name(function_name))
}

/// Every generated file, keyed by path relative to the app root.
pub fn collect(ctx: &PipelineContext) -> FileMap {
    let mut files = FileMap::new();

    if let Some(typespec) = &ctx.typespec {
        files.insert(TYPESPEC_PATH.to_string(), with_newline(&typespec.typespec));
    }
    if let Some(drizzle) = &ctx.drizzle {
        files.insert(DRIZZLE_SCHEMA_PATH.to_string(), with_newline(&drizzle.drizzle_schema));
    }
    if let Some(typescript) = &ctx.typescript {
        files.insert(COMMON_SCHEMA_PATH.to_string(), with_newline(&typescript.typescript_schema));
    }
    for (name, tests) in &ctx.handler_tests {
        files.insert(handler_test_path(name), with_newline(&tests.source));
    }
    for (name, handler) in &ctx.handlers {
        files.insert(handler_path(name), with_newline(&handler.source));
    }

    if !ctx.handlers.is_empty() {
        let entries = handler_entries(ctx);
        files.insert(LOGIC_INDEX_PATH.to_string(), render_logic_index(&entries));
        files.insert(LOGIC_ROUTER_PATH.to_string(), render_logic_router(&entries));
    }
    files
}

fn with_newline(s: &str) -> String {
    let mut out = s.trim_end().to_string();
    out.push('\n');
    out
}

/// A handler as wired into the logic layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandlerEntry {
    pub name: String,
    pub module: String,
    pub description: String,
    pub argument_type: Option<String>,
}

fn handler_entries(ctx: &PipelineContext) -> Vec<HandlerEntry> {
    ctx.handlers
        .keys()
        .map(|name| {
            let description = ctx
                .typespec
                .as_ref()
                .and_then(|t| t.llm_functions.iter().find(|f| &f.name == name))
                .map(|f| f.description.clone())
                .unwrap_or_default();
            let argument_type = ctx
                .typescript
                .as_ref()
                .and_then(|t| t.functions.iter().find(|f| &f.name == name))
                .map(|f| f.argument_type.clone());
            HandlerEntry {
                name: name.clone(),
                module: module_name(name),
                description,
                argument_type,
            }
        })
        .collect()
}

/// `src/logic/index.ts`: the handler registry with descriptions for tool use.
pub fn render_logic_index(entries: &[HandlerEntry]) -> String {
    let mut out = String::new();
    for entry in entries {
        out.push_str(&format!(
            "import * as {name} from \"../handlers/{module}\";\n",
            name = entry.name,
            module = entry.module
        ));
    }
    out.push_str("\nexport const handlers = {\n");
    for entry in entries {
        out.push_str(&format!(
            "    {name}: {{\n        handle: {name}.handle,\n        description: {description},\n    }},\n",
            name = entry.name,
            description = serde_json::Value::String(entry.description.clone()),
        ));
    }
    out.push_str("};\n\nexport type HandlerName = keyof typeof handlers;\n");
    out
}

/// `src/logic/router.ts`: dispatches a named call to its handler.
pub fn render_logic_router(entries: &[HandlerEntry]) -> String {
    let mut out = String::new();
    out.push_str("import { handlers, type HandlerName } from \"./index\";\n");
    let typed: Vec<&HandlerEntry> = entries.iter().filter(|e| e.argument_type.is_some()).collect();
    if !typed.is_empty() {
        let types: Vec<&str> = typed.iter().filter_map(|e| e.argument_type.as_deref()).collect();
        let mut unique = types.clone();
        unique.sort_unstable();
        unique.dedup();
        out.push_str(&format!(
            "import type {{ {} }} from \"../common/schema\";\n",
            unique.join(", ")
        ));
    }
    out.push_str("\nexport type RouterCall =\n");
    for entry in entries {
        let options = entry.argument_type.as_deref().unwrap_or("unknown");
        out.push_str(&format!(
            "    | {{ name: \"{}\"; options: {} }}\n",
            entry.name, options
        ));
    }
    out.push_str("    ;\n\n");
    out.push_str("export async function route(call: RouterCall): Promise<unknown> {\n");
    out.push_str("    switch (call.name) {\n");
    for entry in entries {
        out.push_str(&format!(
            "        case \"{name}\":\n            return handlers.{name}.handle(call.options);\n",
            name = entry.name
        ));
    }
    out.push_str("    }\n}\n\n");
    out.push_str("export function isHandlerName(name: string): name is HandlerName {\n");
    out.push_str("    return name in handlers;\n}\n");
    out
}

/// Directories whose contents are owned by the generator. A regenerated
/// file map replaces them wholesale, so stale handlers are deleted.
pub const GENERATED_DIRS: [&str; 2] = ["src/handlers/", "src/tests/handlers/"];

/// The app tree after generation: `base` with generated directories cleared,
/// template files filled in where `base` lacks them, and generated files on top.
pub fn overlay(base: &FileMap, template: &FileMap, generated: &FileMap) -> FileMap {
    let mut out: FileMap = base
        .iter()
        .filter(|(path, _)| !GENERATED_DIRS.iter().any(|dir| path.starts_with(dir)))
        .map(|(path, content)| (path.clone(), content.clone()))
        .collect();
    for (path, content) in template {
        out.entry(path.clone()).or_insert_with(|| content.clone());
    }
    out.extend(generated.iter().map(|(path, content)| (path.clone(), content.clone())));
    out
}

const SKIPPED_DIRS: [&str; 4] = ["node_modules", ".git", "dist", ".turbo"];

/// Read a template directory into a file map, skipping dependency and build
/// directories and anything that is not UTF-8 text.
pub fn load_template(root: &Path) -> Result<FileMap> {
    let mut files = FileMap::new();
    let walker = walkdir::WalkDir::new(root).into_iter().filter_entry(|entry| {
        entry.depth() == 0
            || !SKIPPED_DIRS
                .iter()
                .any(|skip| entry.file_name().to_string_lossy() == *skip)
    });
    for entry in walker {
        let entry = entry.with_context(|| format!("Failed to walk template {}", root.display()))?;
        if !entry.file_type().is_file() {
            continue;
        }
        let Ok(content) = std::fs::read_to_string(entry.path()) else {
            tracing::debug!(path = %entry.path().display(), "Skipping non-text template file");
            continue;
        };
        let rel = entry
            .path()
            .strip_prefix(root)
            .with_context(|| format!("{} is outside the template", entry.path().display()))?;
        files.insert(rel.to_string_lossy().replace('\\', "/"), content);
    }
    Ok(files)
}

/// Write a file map under `root`, creating directories as needed.
pub fn write_to_dir(files: &FileMap, root: &Path) -> Result<()> {
    for (rel, content) in files {
        let path = root.join(rel);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
        std::fs::write(&path, content)
            .with_context(|| format!("Failed to write {}", path.display()))?;
    }
    Ok(())
}
