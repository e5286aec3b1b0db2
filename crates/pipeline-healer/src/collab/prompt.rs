//! Fix prompt rendering.

use anyhow::Result;
use handlebars::Handlebars;
use serde::Serialize;

use super::FixRequest;
use crate::error::CodegenError;
use crate::run::Category;

const FIX_TEMPLATE_NAME: &str = "fix";

/// Reply the model is told to give when it cannot fix the file.
pub const NO_CONFIDENT_FIX: &str = "NO_CONFIDENT_FIX";

#[derive(Serialize)]
struct Issue<'a> {
    number: usize,
    category: &'a str,
    line: u32,
    description: &'a str,
}

#[derive(Serialize)]
struct Guidance {
    category: &'static str,
    advice: &'static str,
}

#[derive(Serialize)]
struct FixPromptData<'a> {
    path: &'a str,
    content: &'a str,
    issues: Vec<Issue<'a>>,
    guidance: Vec<Guidance>,
    no_fix_marker: &'static str,
}

fn advice(category: Category) -> &'static str {
    match category {
        Category::Syntax => "Repair the syntax error: missing colons, brackets, quotes or parentheses.",
        Category::Indentation => "Use consistent indentation; do not mix tabs and spaces.",
        Category::Import => "Remove unused imports or fix the imported name and module path.",
        Category::TypeError => "Make the types agree, converting values where needed.",
        Category::Logic => "Correct the computation so the failing assertion holds. Fix the code under test, not the test.",
        Category::Linting => "Resolve the lint finding without changing behaviour.",
        Category::Unknown => "Fix the reported problem with the smallest change that works.",
    }
}

/// Renders the prompt sent to the code generator.
pub struct PromptRenderer {
    handlebars: Handlebars<'static>,
}

impl PromptRenderer {
    pub fn new() -> Result<Self> {
        let mut handlebars = Handlebars::new();
        handlebars.set_strict_mode(true);
        // Source code must reach the model verbatim.
        handlebars.register_escape_fn(handlebars::no_escape);
        handlebars.register_template_string(FIX_TEMPLATE_NAME, FIX_TEMPLATE)?;
        Ok(Self { handlebars })
    }

    pub fn render_fix(&self, request: &FixRequest) -> Result<String, CodegenError> {
        let issues = request
            .failures
            .iter()
            .enumerate()
            .map(|(i, f)| Issue {
                number: i + 1,
                category: f.category.as_str(),
                line: f.line,
                description: &f.description,
            })
            .collect();

        let mut categories: Vec<Category> = Vec::new();
        for failure in &request.failures {
            if !categories.contains(&failure.category) {
                categories.push(failure.category);
            }
        }
        let guidance = categories
            .into_iter()
            .map(|c| Guidance {
                category: c.as_str(),
                advice: advice(c),
            })
            .collect();

        let data = FixPromptData {
            path: &request.path,
            content: &request.content,
            issues,
            guidance,
            no_fix_marker: NO_CONFIDENT_FIX,
        };
        self.handlebars
            .render(FIX_TEMPLATE_NAME, &data)
            .map_err(|e| CodegenError::Prompt(e.to_string()))
    }
}

const FIX_TEMPLATE: &str = r"You are an expert code fixer. Fix ALL of the issues listed below in a single pass.

FILE: {{path}}

ISSUES TO FIX:
{{#each issues}}
{{number}}. [{{category}}] Line {{line}}: {{description}}
{{/each}}

ORIGINAL CODE:
```
{{content}}
```

INSTRUCTIONS:
- Make the minimal changes needed to fix every issue.
- Keep everything else exactly as it is, including comments and formatting.
- Return ONLY the complete corrected file, with no explanation.
- If you cannot fix the file with confidence, reply with exactly {{no_fix_marker}}.

GUIDANCE:
{{#each guidance}}
- {{category}}: {{advice}}
{{/each}}
";
