//! Keyword filtering over search results.

use crate::model::SearchResult;

/// Splits a keyword into lowercase tokens. Double-quoted substrings are kept
/// as single tokens (without the quotes); everything else splits on
/// whitespace.
fn tokenize(keyword: &str) -> Vec<String> {
    let lowered = keyword.to_lowercase();
    let mut tokens = Vec::new();
    let mut current = String::new();
    let mut in_quotes = false;

    for ch in lowered.chars() {
        match ch {
            '"' => {
                if in_quotes && !current.is_empty() {
                    tokens.push(std::mem::take(&mut current));
                }
                in_quotes = !in_quotes;
            }
            c if c.is_whitespace() && !in_quotes => {
                if !current.is_empty() {
                    tokens.push(std::mem::take(&mut current));
                }
            }
            c => current.push(c),
        }
    }
    if !current.is_empty() {
        tokens.push(current);
    }

    tokens
}

/// Keeps the results matching every token of `keyword`.
///
/// A result passes iff each lowercased token is a substring of
/// `lower(title) ∥ " " ∥ lower(content) ∥ " " ∥ lower(join(work_titles))`
/// (logical AND). Whole results are kept or dropped; individual links are
/// never removed here. An empty tokenization returns the input unchanged.
pub fn filter_results_by_keyword(results: Vec<SearchResult>, keyword: &str) -> Vec<SearchResult> {
    let tokens = tokenize(keyword);
    if tokens.is_empty() {
        return results;
    }

    results
        .into_iter()
        .filter(|result| {
            let work_titles = result
                .links
                .iter()
                .filter_map(|link| link.work_title.as_deref())
                .collect::<Vec<_>>()
                .join(" ");
            let haystack = format!(
                "{} {} {}",
                result.title.to_lowercase(),
                result.content.to_lowercase(),
                work_titles.to_lowercase()
            );
            tokens.iter().all(|token| haystack.contains(token.as_str()))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Link;

    fn result(title: &str, content: &str) -> SearchResult {
        SearchResult {
            unique_id: format!("t-{title}"),
            title: title.into(),
            content: content.into(),
            links: vec![Link::new("https://pan.quark.cn/s/abc")],
            ..Default::default()
        }
    }

    #[test]
    fn and_of_tokens() {
        let results = vec![result("alpha bravo", ""), result("alpha", "")];
        let kept = filter_results_by_keyword(results, "alpha bravo");
        assert_eq!(kept.len(), 1);
        assert_eq!(kept[0].title, "alpha bravo");
    }

    #[test]
    fn tokens_may_match_across_fields() {
        // k1 in the title, k2 in the content: passes. Remove k2 from the
        // content and the same result fails.
        let passes = result("alpha movie", "remastered bravo cut");
        let fails = result("alpha movie", "remastered cut");
        assert_eq!(
            filter_results_by_keyword(vec![passes], "alpha bravo").len(),
            1
        );
        assert_eq!(
            filter_results_by_keyword(vec![fails], "alpha bravo").len(),
            0
        );
    }

    #[test]
    fn work_titles_count_toward_the_haystack() {
        let mut r = result("collection", "");
        r.links[0].work_title = Some("Alpha.S01E01.mkv".into());
        assert_eq!(filter_results_by_keyword(vec![r], "alpha").len(), 1);
    }

    #[test]
    fn quoted_phrases_stay_whole() {
        let results = vec![result("alpha bravo", ""), result("bravo alpha", "")];
        let kept = filter_results_by_keyword(results, "\"alpha bravo\"");
        assert_eq!(kept.len(), 1);
        assert_eq!(kept[0].title, "alpha bravo");
    }

    #[test]
    fn empty_keyword_is_a_pass_through() {
        let results = vec![result("anything", "")];
        assert_eq!(filter_results_by_keyword(results.clone(), "").len(), 1);
        assert_eq!(filter_results_by_keyword(results, "   ").len(), 1);
    }

    #[test]
    fn matching_is_case_insensitive() {
        let results = vec![result("ALPHA Movie", "")];
        assert_eq!(filter_results_by_keyword(results, "alpha").len(), 1);
    }
}
