use std::collections::HashMap;

use super::ExpertInput;
use crate::crawl::CrawledPage;

/// Character budget for the `{{pages}}` block of a prompt.
pub const MAX_PAGES_CHARS: usize = 60_000;
/// Character budget per page inside that block.
const MAX_PAGE_CHARS: usize = 4_000;

pub fn render_prompt(template: &str, vars: &HashMap<String, String>) -> String {
    let mut result = template.to_string();
    for (key, value) in vars {
        let placeholder = format!("{{{{{}}}}}", key);
        result = result.replace(&placeholder, value);
    }
    result
}

pub fn truncate(s: &str, max: usize) -> String {
    if s.len() <= max {
        s.to_string()
    } else {
        let mut end = max;
        while !s.is_char_boundary(end) {
            end -= 1;
        }
        format!("{}…", &s[..end])
    }
}

/// Variables every expert prompt can reference.
pub fn prompt_vars(
    input: &ExpertInput,
    pages: &[CrawledPage],
    prior_results: &[(String, String)],
) -> HashMap<String, String> {
    let mut vars = HashMap::new();
    vars.insert("subject".to_string(), input.subject_id.clone());
    vars.insert("url".to_string(), input.context.url.clone());
    vars.insert(
        "label".to_string(),
        input.context.display_name().to_string(),
    );
    vars.insert("pages".to_string(), format_pages(pages));
    vars.insert("prior_results".to_string(), format_prior(prior_results));
    vars
}

fn format_pages(pages: &[CrawledPage]) -> String {
    if pages.is_empty() {
        return "(no crawled pages available)".to_string();
    }
    let mut out = String::new();
    for page in pages {
        let title = page.title.as_deref().unwrap_or("untitled");
        let section = format!(
            "## {} ({title})\n{}\n\n",
            page.url,
            truncate(&page.text, MAX_PAGE_CHARS)
        );
        if out.len() + section.len() > MAX_PAGES_CHARS {
            out.push_str("(remaining pages omitted)\n");
            break;
        }
        out.push_str(&section);
    }
    out
}

fn format_prior(prior: &[(String, String)]) -> String {
    if prior.is_empty() {
        return "(no earlier results)".to_string();
    }
    prior
        .iter()
        .map(|(name, text)| format!("### {name}\n{}", text.trim()))
        .collect::<Vec<_>>()
        .join("\n\n")
}
