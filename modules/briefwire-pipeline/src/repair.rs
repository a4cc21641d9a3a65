//! The validate → repair → retry protocol shared by the outline and article
//! stages: each failed attempt appends a numbered list of the violated rules
//! to the base prompt.

/// Total attempts for any repairable LLM stage.
pub const MAX_REPAIR_ATTEMPTS: u32 = 3;

/// Build the repair block appended to the base prompt after a failed attempt.
pub fn repair_instruction(errors: &[String]) -> String {
    let mut out = String::from(
        "Your previous response violated these rules. Fix every one of them and respond again with JSON only:\n",
    );
    for (i, error) in errors.iter().enumerate() {
        out.push_str(&format!("{}. {}\n", i + 1, error));
    }
    out
}

/// `base + "\n\n" + repair_instruction(errors)`.
pub fn prompt_with_repairs(base_prompt: &str, errors: &[String]) -> String {
    format!("{base_prompt}\n\n{}", repair_instruction(errors))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rules_are_numbered_from_one() {
        let block = repair_instruction(&[
            "Thesis must be at least 12 characters".into(),
            "Outline must contain exactly 5 points; got 3".into(),
        ]);
        assert!(block.contains("1. Thesis must be at least 12 characters"));
        assert!(block.contains("2. Outline must contain exactly 5 points; got 3"));
    }

    #[test]
    fn repaired_prompt_keeps_the_base() {
        let prompt = prompt_with_repairs("BASE", &["rule".into()]);
        assert!(prompt.starts_with("BASE\n\n"));
        assert!(prompt.contains("1. rule"));
    }
}
