//! Tests for recipe parsing edge cases.

use proobox::recipe::{Directive, Recipe};
use std::fs;
use tempfile::TempDir;

// =============================================================================
// Structure
// =============================================================================

#[test]
fn test_from_must_be_first_directive() {
    let err = Recipe::parse("RUN echo hi\nFROM alpine\n").unwrap_err();
    assert!(err.to_string().contains("FROM"));
}

#[test]
fn test_comments_before_from_are_fine() {
    let recipe = Recipe::parse("# syntax note\n\nFROM alpine:3.20.0\n").unwrap();
    assert_eq!(recipe.base, "alpine:3.20.0");
    assert!(recipe.steps.is_empty());
}

#[test]
fn test_second_from_rejected() {
    let err = Recipe::parse("FROM alpine\nFROM ubuntu\n").unwrap_err();
    assert!(err.to_string().contains("FROM"));
}

#[test]
fn test_empty_recipe_rejected() {
    assert!(Recipe::parse("").is_err());
    assert!(Recipe::parse("# only comments\n").is_err());
}

#[test]
fn test_keywords_case_insensitive() {
    let recipe = Recipe::parse("from alpine\nrun echo hi\nenv A=1\n").unwrap();
    assert_eq!(recipe.base, "alpine");
    assert_eq!(recipe.steps.len(), 2);
    assert_eq!(recipe.steps[0].line, "RUN echo hi");
}

// =============================================================================
// Directives
// =============================================================================

#[test]
fn test_run_preserves_shell_text() {
    let recipe = Recipe::parse("FROM x\nRUN apk add curl && rm -rf /var/cache/apk/*\n").unwrap();
    assert_eq!(
        recipe.steps[0].directive,
        Directive::Run("apk add curl && rm -rf /var/cache/apk/*".to_string())
    );
}

#[test]
fn test_copy_requires_two_operands() {
    assert!(Recipe::parse("FROM x\nCOPY onlyone\n").is_err());
    assert!(Recipe::parse("FROM x\nCOPY a b c\n").is_err());

    let recipe = Recipe::parse("FROM x\nCOPY app.sh /usr/local/bin/app.sh\n").unwrap();
    assert_eq!(
        recipe.steps[0].directive,
        Directive::Copy {
            src: "app.sh".to_string(),
            dst: "/usr/local/bin/app.sh".to_string(),
        }
    );
}

#[test]
fn test_env_value_with_spaces() {
    let recipe = Recipe::parse("FROM x\nENV GREETING hello there\n").unwrap();
    assert_eq!(
        recipe.steps[0].directive,
        Directive::Env("GREETING=hello there".to_string())
    );
}

#[test]
fn test_env_equals_form_keeps_value_verbatim() {
    let recipe = Recipe::parse("FROM x\nENV PATH=/custom/bin:/usr/bin\n").unwrap();
    assert_eq!(
        recipe.steps[0].directive,
        Directive::Env("PATH=/custom/bin:/usr/bin".to_string())
    );
}

#[test]
fn test_cmd_must_be_json_array() {
    assert!(Recipe::parse("FROM x\nCMD /bin/sh -c run\n").is_err());

    let recipe = Recipe::parse("FROM x\nCMD [\"/app\", \"--serve\"]\n").unwrap();
    assert_eq!(
        recipe.steps[0].directive,
        Directive::Cmd(vec!["/app".to_string(), "--serve".to_string()])
    );
}

#[test]
fn test_cmd_empty_array_allowed() {
    let recipe = Recipe::parse("FROM x\nCMD []\n").unwrap();
    assert_eq!(recipe.steps[0].directive, Directive::Cmd(vec![]));
}

// =============================================================================
// Canonical Lines
// =============================================================================

#[test]
fn test_step_lines_are_canonical() {
    let recipe = Recipe::parse("FROM x\n  run   echo hi\n").unwrap();
    // Keyword is upcased; the argument text is preserved.
    assert_eq!(recipe.steps[0].line, "RUN echo hi");
}

#[test]
fn test_unknown_directives_do_not_consume_steps() {
    let recipe = Recipe::parse("FROM x\nEXPOSE 80\nVOLUME /data\nRUN true\n").unwrap();
    assert_eq!(recipe.steps.len(), 1);
    assert_eq!(recipe.steps[0].directive, Directive::Run("true".to_string()));
}

// =============================================================================
// Files
// =============================================================================

#[test]
fn test_parse_file() {
    let temp = TempDir::new().unwrap();
    let path = temp.path().join("Prootfile");
    fs::write(&path, "FROM alpine:3.20.0\nRUN true\n").unwrap();

    let recipe = Recipe::parse_file(&path).unwrap();
    assert_eq!(recipe.base, "alpine:3.20.0");
}

#[test]
fn test_parse_missing_file() {
    let temp = TempDir::new().unwrap();
    assert!(Recipe::parse_file(&temp.path().join("nope")).is_err());
}
