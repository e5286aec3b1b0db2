//! Ordered category rule table.
//!
//! Rules are evaluated top to bottom and the first rule with a matching
//! pattern decides the category. The order is the priority order:
//! SYNTAX, INDENTATION, IMPORT, TYPE_ERROR, LOGIC, LINTING, then UNKNOWN.

use regex::Regex;
use std::sync::LazyLock;

use crate::run::Category;

/// One entry of the rule table.
pub struct CategoryRule {
    pub category: Category,
    patterns: Vec<Regex>,
}

impl CategoryRule {
    fn new(category: Category, patterns: &[&str]) -> Self {
        Self {
            category,
            patterns: patterns
                .iter()
                .map(|p| Regex::new(&format!("(?i){p}")).unwrap())
                .collect(),
        }
    }

    pub fn matches(&self, text: &str) -> bool {
        self.patterns.iter().any(|p| p.is_match(text))
    }
}

static RULES: LazyLock<Vec<CategoryRule>> = LazyLock::new(|| {
    vec![
        CategoryRule::new(
            Category::Syntax,
            &[
                r"syntaxerror",
                r"syntax error",
                r"unexpected token",
                r"unexpected identifier",
                r"parseerror",
                r"parsing error",
                r"missing semicolon",
                r"unexpected end of input",
                r"\bE9\d\d\b", // flake8 runtime/syntax errors
            ],
        ),
        CategoryRule::new(
            Category::Indentation,
            &[
                r"indentationerror",
                r"taberror",
                r"unexpected indent",
                r"expected an indented block",
                r"unindent does not match",
                r"\bE1[0-3]\d\b", // pycodestyle indentation
                r"\bW191\b",
            ],
        ),
        CategoryRule::new(
            Category::Import,
            &[
                r"modulenotfounderror",
                r"importerror",
                r"cannot import name",
                r"cannot find module",
                r"no module named",
                r"module not found",
                r"cannot resolve module",
                r"require is not defined",
                r"unused import",
                r"imported but unused",
                r"\bF40[1-5]\b",
                r"\bW0611\b",
            ],
        ),
        CategoryRule::new(
            Category::TypeError,
            &[
                r"typeerror",
                r"type error",
                r"cannot read propert",
                r"is not a function",
                r"nonetype",
                r"attributeerror",
                r"undefined is not",
                r"null is not",
                r"\bTS\d{4}\b",
            ],
        ),
        CategoryRule::new(
            Category::Logic,
            &[
                r"assertionerror",
                r"\bassert(ion)?\b",
                r"expected.*\b(received|but got|got)\b",
                r"\.to(Be|Equal|StrictEqual)\b",
                r"wrong result",
                r"does not match",
                r"mismatch",
                r"\bfailed\b",
            ],
        ),
        CategoryRule::new(
            Category::Linting,
            &[
                r"unused variable",
                r"no-unused-vars",
                r"undefined variable",
                r"undefined name",
                r"\bE0602\b",
                r"eslint",
                r"never used",
                r"is assigned a value but",
                r"line too long",
                r"blank line",
                r"whitespace",
                r"\b[CEFNW]\d{3}\b", // any remaining flake8 code
            ],
        ),
    ]
});

/// The rule table in priority order.
pub fn rules() -> &'static [CategoryRule] {
    &RULES
}

/// Category of a diagnostic text: first matching rule, or UNKNOWN.
pub fn categorize(text: &str) -> Category {
    RULES
        .iter()
        .find(|rule| rule.matches(text))
        .map_or(Category::Unknown, |rule| rule.category)
}
