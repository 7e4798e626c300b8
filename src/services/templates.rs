use std::collections::BTreeMap;

/// Host-side template variable substitution, consumed as a black box.
pub trait TemplateSubstitutor: Send + Sync {
    fn variable_names(&self) -> Vec<String>;
    fn substitute(&self, text: &str) -> String;
}

/// Substitution backed by a plain `name -> value` map, as supplied with a query request.
#[derive(Debug, Clone, Default)]
pub struct VariableMap {
    values: BTreeMap<String, String>,
}

impl VariableMap {
    pub fn new(values: BTreeMap<String, String>) -> Self {
        let values = values
            .into_iter()
            .map(|(name, value)| (name.trim().trim_start_matches('$').to_string(), value))
            .filter(|(name, _)| !name.is_empty())
            .collect();
        Self { values }
    }
}

fn longest_first(mut names: Vec<String>) -> Vec<String> {
    names.sort_by(|a, b| b.len().cmp(&a.len()).then_with(|| a.cmp(b)));
    names.dedup();
    names
}

fn variable_tokens(name: &str) -> [String; 2] {
    [format!("${{{name}}}"), format!("${name}")]
}

impl TemplateSubstitutor for VariableMap {
    fn variable_names(&self) -> Vec<String> {
        self.values.keys().cloned().collect()
    }

    fn substitute(&self, text: &str) -> String {
        let mut out = text.to_string();
        for name in longest_first(self.variable_names()) {
            let Some(value) = self.values.get(&name) else {
                continue;
            };
            for token in variable_tokens(&name) {
                if out.contains(&token) {
                    out = out.replace(&token, value);
                }
            }
        }
        out
    }
}

/// Replaces every `$name` / `${name}` in `expression`, longest variable name first so that
/// `$region` never eats the prefix of `$region_id`.
pub fn substitute_expression(expression: &str, templates: &dyn TemplateSubstitutor) -> String {
    if !expression.contains('$') {
        return expression.to_string();
    }

    let mut out = expression.to_string();
    for name in longest_first(templates.variable_names()) {
        for token in variable_tokens(&name) {
            if out.contains(&token) {
                let value = templates.substitute(&token);
                out = out.replace(&token, &value);
            }
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vars(pairs: &[(&str, &str)]) -> VariableMap {
        VariableMap::new(
            pairs
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        )
    }

    #[test]
    fn longest_name_wins_over_prefix() {
        let templates = vars(&[("region", "2"), ("region_id", "40")]);
        let out = substitute_expression("A * $region_id + $region", &templates);
        assert_eq!(out, "A * 40 + 2");
    }

    #[test]
    fn substitutes_braced_tokens_and_every_occurrence() {
        let templates = vars(&[("scale", "10")]);
        let out = substitute_expression("A * ${scale} + B * $scale", &templates);
        assert_eq!(out, "A * 10 + B * 10");
    }

    #[test]
    fn substitution_is_idempotent() {
        let templates = vars(&[("scale", "10"), ("offset", "3")]);
        let once = substitute_expression("A * $scale - $offset", &templates);
        let twice = substitute_expression(&once, &templates);
        assert_eq!(once, twice);
    }

    #[test]
    fn unknown_variables_are_left_untouched() {
        let templates = vars(&[("scale", "10")]);
        assert_eq!(substitute_expression("A * $other", &templates), "A * $other");
        assert_eq!(substitute_expression("A + B", &templates), "A + B");
    }
}
