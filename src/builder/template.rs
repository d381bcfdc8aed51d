use std::borrow::Cow;
use std::collections::BTreeMap;
use std::sync::OnceLock;

use regex::{Captures, Regex};

fn placeholder() -> &'static Regex {
    static PLACEHOLDER: OnceLock<Regex> = OnceLock::new();
    PLACEHOLDER.get_or_init(|| {
        Regex::new(r"\{\{\s*([A-Za-z0-9_.\-]+)\s*\}\}").expect("placeholder pattern is valid")
    })
}

/// Replace `{{ name }}` placeholders with the matching field. Placeholders
/// without a field are left untouched.
pub fn render<'a>(template: &'a str, fields: &BTreeMap<String, String>) -> Cow<'a, str> {
    placeholder().replace_all(template, |caps: &Captures<'_>| match fields.get(&caps[1]) {
        Some(value) => value.clone(),
        None => caps[0].to_owned(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn substitutes_known_fields() {
        let mut fields = BTreeMap::new();
        fields.insert("name".to_owned(), "Ada".to_owned());
        fields.insert("email".to_owned(), "ada@example.com".to_owned());

        assert_eq!(
            render("<p>Hi {{ name }} ({{email}})</p>", &fields),
            "<p>Hi Ada (ada@example.com)</p>"
        );
        assert_eq!(render("{{ missing }} stays", &fields), "{{ missing }} stays");
        assert_eq!(render("no placeholders", &fields), "no placeholders");
    }
}
