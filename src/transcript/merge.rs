/// Merges a new final fragment into accumulated text, deduplicating the
/// overlaps streaming recognizers produce:
/// - the text already ends with the new fragment: unchanged;
/// - the new fragment contains the whole accumulated text (a re-emission
///   that grew): the fragment replaces it;
/// - otherwise: space-joined append.
pub fn clean_and_merge(current: &str, new: &str) -> String {
    let new = new.trim();
    if new.is_empty() {
        return current.to_string();
    }
    if current.ends_with(new) {
        return current.to_string();
    }
    if !current.is_empty() && new.contains(current) {
        return new.to_string();
    }
    if current.is_empty() {
        return new.to_string();
    }
    let separator = if current.ends_with(' ') { "" } else { " " };
    format!("{current}{separator}{new}")
}
