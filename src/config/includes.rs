use super::{ImportRule, RuleOrInclude};
use anyhow::{anyhow, Context, Result};
use std::path::{Path, PathBuf};

/// Walk a rule list in order, loading `include` entries relative to the
/// working directory, and produce the flat list of import rules.
pub fn resolve_includes(workdir: &Path, rules: &[RuleOrInclude]) -> Result<Vec<ImportRule>> {
    let mut resolved = Vec::new();
    let mut stack = Vec::new();
    resolve(workdir, rules, &mut stack, &mut resolved)?;
    Ok(resolved)
}

fn resolve(
    workdir: &Path,
    rules: &[RuleOrInclude],
    stack: &mut Vec<PathBuf>,
    resolved: &mut Vec<ImportRule>,
) -> Result<()> {
    for rule in rules {
        match rule {
            RuleOrInclude::Rule(import_rule) => resolved.push(import_rule.clone()),
            RuleOrInclude::Include(include_rule) => {
                for include in include_rule.include.iter() {
                    let include_path = workdir.join(include);
                    if stack.contains(&include_path) {
                        return Err(anyhow!(
                            "Include cycle detected: {} -> {}",
                            stack
                                .iter()
                                .map(|p| p.display().to_string())
                                .collect::<Vec<_>>()
                                .join(" -> "),
                            include_path.display()
                        ));
                    }
                    let contents = std::fs::read_to_string(&include_path).with_context(|| {
                        format!("Failed to read include file {}", include_path.display())
                    })?;
                    let included: Vec<RuleOrInclude> = serde_yaml::from_str(&contents)
                        .with_context(|| {
                            format!("Failed to parse include file {}", include_path.display())
                        })?;
                    stack.push(include_path);
                    resolve(workdir, &included, stack, resolved)?;
                    stack.pop();
                }
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod includes_tests {
    use super::*;
    use anyhow::Result;
    use indoc::indoc;

    fn parse(doc: &str) -> Result<Vec<RuleOrInclude>> {
        Ok(serde_yaml::from_str(doc)?)
    }

    #[test]
    fn plain_rules_pass_through() -> Result<()> {
        let rules = parse(indoc! {r#"
            - match:
                desc: A.*
              actions:
                - type: ignore
            - match:
                desc: B.*
              actions:
                - type: ignore
        "#})?;
        let resolved = resolve_includes(Path::new("."), &rules)?;
        assert_eq!(resolved.len(), 2);
        Ok(())
    }

    #[test]
    fn includes_resolve_in_declaration_order() -> Result<()> {
        let workdir = tempfile::tempdir()?;
        std::fs::write(
            workdir.path().join("first.yaml"),
            indoc! {r#"
                - name: first
                  match:
                    desc: A.*
                  actions:
                    - type: ignore
            "#},
        )?;
        std::fs::write(
            workdir.path().join("second.yaml"),
            indoc! {r#"
                - include: first.yaml
                - name: second
                  match:
                    desc: B.*
                  actions:
                    - type: ignore
            "#},
        )?;
        let rules = parse(indoc! {r#"
            - include: second.yaml
            - name: last
              match:
                desc: C.*
              actions:
                - type: ignore
        "#})?;
        let resolved = resolve_includes(workdir.path(), &rules)?;
        let names: Vec<_> = resolved.iter().filter_map(|r| r.name.as_deref()).collect();
        assert_eq!(names, vec!["first", "second", "last"]);
        Ok(())
    }

    #[test]
    fn include_cycle_is_an_error() -> Result<()> {
        let workdir = tempfile::tempdir()?;
        std::fs::write(
            workdir.path().join("a.yaml"),
            "- include: b.yaml\n",
        )?;
        std::fs::write(
            workdir.path().join("b.yaml"),
            "- include: a.yaml\n",
        )?;
        let rules = parse("- include: a.yaml\n")?;
        let err = resolve_includes(workdir.path(), &rules).unwrap_err();
        assert!(err.to_string().contains("Include cycle"));
        Ok(())
    }
}
