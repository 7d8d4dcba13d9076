//! Country spellings that CRM data commonly mixes in one column.

const GROUPS: &[&[&str]] = &[
    &["US", "USA", "United States", "United States of America", "America"],
    &["UK", "GB", "United Kingdom", "Great Britain", "England"],
    &["DE", "Germany", "Deutschland"],
    &["FR", "France"],
    &["CA", "Canada"],
    &["JP", "Japan"],
    &["India", "Bharat"],
    &["AU", "Australia"],
    &["BR", "Brazil"],
    &["CN", "China"],
    &["NL", "Netherlands", "Holland"],
    &["ES", "Spain"],
];

/// Every known spelling of the country named by `term`, if it names one.
pub fn aliases(term: &str) -> Option<&'static [&'static str]> {
    let term = term.trim();
    GROUPS
        .iter()
        .copied()
        .find(|group| group.iter().any(|alias| alias.eq_ignore_ascii_case(term)))
}

pub fn same_country(left: &str, right: &str) -> bool {
    aliases(left).is_some_and(|group| group.iter().any(|alias| alias.eq_ignore_ascii_case(right)))
}

#[cfg(test)]
mod tests {
    use super::{aliases, same_country};

    #[test]
    fn us_spellings_share_a_group() {
        let group = aliases("usa").expect("group");
        assert!(group.contains(&"United States"));
        assert!(same_country("US", "united states"));
        assert!(!same_country("US", "Canada"));
    }

    #[test]
    fn unknown_places_have_no_group() {
        assert!(aliases("Atlantis").is_none());
    }
}
