use std::collections::HashMap;

use anyhow::Result;

use crate::api::{EditRequest, WikiApi};
use crate::cluster::PageRef;
use crate::error::SyncError;

/// Write tokens per language, fetched on first use and kept for the run.
#[derive(Debug, Default)]
pub struct TokenCache {
    tokens: HashMap<String, String>,
}

impl TokenCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get<A: WikiApi + ?Sized>(&mut self, api: &mut A, language: &str) -> Result<String> {
        if let Some(token) = self.tokens.get(language) {
            return Ok(token.clone());
        }
        let token = api.get_csrf_token(language)?;
        self.tokens.insert(language.to_string(), token.clone());
        Ok(token)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EditOutcome {
    pub page: PageRef,
    pub result: String,
}

/// Save `content` as a bot edit of an existing page. Anything but `Success` is fatal.
pub fn save_page<A: WikiApi + ?Sized>(
    api: &mut A,
    tokens: &mut TokenCache,
    page: &PageRef,
    content: &str,
    summary: &str,
) -> Result<EditOutcome> {
    let token = tokens.get(api, &page.language)?;
    let response = api.edit(&EditRequest {
        language: &page.language,
        title: &page.title,
        text: content,
        summary,
        token: &token,
    })?;

    if !response.is_success() {
        let diagnostic = serde_json::to_string_pretty(&response.raw)
            .unwrap_or_else(|_| response.raw.to_string());
        tracing::error!(language = %page.language, title = %page.title, "edit rejected");
        return Err(SyncError::EditRejected {
            language: page.language.clone(),
            title: page.title.clone(),
            result: response.result.unwrap_or_else(|| "<none>".to_string()),
            diagnostic,
        }
        .into());
    }

    Ok(EditOutcome {
        page: page.clone(),
        result: response.result.unwrap_or_default(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::tests::cat_family;

    #[test]
    fn token_is_fetched_once_per_language() {
        let mut api = cat_family();
        let mut tokens = TokenCache::new();
        for _ in 0..3 {
            tokens.get(&mut api, "en").expect("token");
        }
        tokens.get(&mut api, "fr").expect("token");
        assert_eq!(api.token_requests, vec!["en".to_string(), "fr".to_string()]);
    }

    #[test]
    fn save_page_writes_content() {
        let mut api = cat_family();
        let mut tokens = TokenCache::new();
        let page = PageRef::new("fr", "Chat");
        let outcome = save_page(&mut api, &mut tokens, &page, "Nouveau", "iw").expect("save");
        assert_eq!(outcome.result, "Success");
        assert_eq!(api.content_of("fr", "Chat"), Some("Nouveau"));
    }

    #[test]
    fn rejected_edit_carries_full_diagnostic() {
        let mut api = cat_family();
        api.reject_edits = true;
        let mut tokens = TokenCache::new();
        let error = save_page(&mut api, &mut tokens, &PageRef::new("en", "Cat"), "x", "iw")
            .expect_err("must fail");
        match error.downcast_ref::<SyncError>() {
            Some(SyncError::EditRejected {
                title,
                result,
                diagnostic,
                ..
            }) => {
                assert_eq!(title, "Cat");
                assert_eq!(result, "Failure");
                assert!(diagnostic.contains("spamblacklist"));
            }
            other => panic!("unexpected error: {other:?}"),
        }
        assert!(api.edits.is_empty());
    }
}
