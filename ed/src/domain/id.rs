//! Record ID generation

use uuid::Uuid;

/// Generate a record ID of the form `{short-uuid}-{kind}-{slug}`
///
/// The kind tags the record family ("iter", "run", "out", ...) and the slug
/// is a human-readable hint derived from the descriptive text. IDs sort
/// roughly by creation time because the uuid prefix is v7.
pub fn generate_id(kind: &str, hint: &str) -> String {
    let uuid = Uuid::now_v7().simple().to_string();
    let slug = slugify(hint, 40);
    if slug.is_empty() {
        format!("{}-{}", &uuid[..12], kind)
    } else {
        format!("{}-{}-{}", &uuid[..12], kind, slug)
    }
}

fn slugify(text: &str, max_len: usize) -> String {
    let mut slug: String = text
        .to_lowercase()
        .chars()
        .map(|c| if c.is_alphanumeric() { c } else { '-' })
        .collect();
    while slug.contains("--") {
        slug = slug.replace("--", "-");
    }
    let slug = slug.trim_matches('-');
    slug.chars().take(max_len).collect()
}
