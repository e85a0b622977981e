//! Site-wide interwiki pass: page through every title of one language edition,
//! resolve each title's cluster and rewrite every member whose text drifted.
//!
//! The listing cursor is persisted before a batch is processed, so an
//! interrupted run resumes at the start of the following batch. Titles of the
//! interrupted batch that were already written are visited again on resume,
//! which is harmless because rewriting is idempotent.

use anyhow::Result;
use serde::Serialize;
use similar::TextDiff;

use crate::api::WikiApi;
use crate::cluster::{ClusterMember, LangLinks, PageRef, RunMemory, resolve_cluster};
use crate::commit::{TokenCache, save_page};
use crate::conflict::ConflictResolver;
use crate::rewrite::rewrite_with_stale;
use crate::storage::{
    Checkpoint, CheckpointKeys, KeyValueStore, clear_checkpoint, load_checkpoint, save_checkpoint,
};

#[derive(Debug, Clone)]
pub struct SyncOptions {
    /// Language edition whose titles seed the clusters.
    pub language: String,
    pub summary: String,
    /// Compute rewrites without fetching tokens, editing or moving the checkpoint.
    pub dry_run: bool,
    /// Sync one seed title instead of paging through the site.
    pub single_title: Option<String>,
    /// Stop after this many listing batches, leaving the checkpoint in place.
    pub max_batches: Option<usize>,
}

impl SyncOptions {
    pub fn new(language: impl Into<String>, summary: impl Into<String>) -> Self {
        Self {
            language: language.into(),
            summary: summary.into(),
            dry_run: false,
            single_title: None,
            max_batches: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct EditPreview {
    pub page: PageRef,
    pub diff: String,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct SyncReport {
    pub batches: usize,
    pub titles: usize,
    pub clusters: usize,
    pub pages_saved: usize,
    pub pages_unchanged: usize,
    pub missing: usize,
    pub rejected: usize,
    pub conflicts_prompted: usize,
    pub request_count: usize,
    pub exhausted: bool,
    pub resumed_from: Option<Checkpoint>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub previews: Vec<EditPreview>,
}

/// State shared by every title of one run.
#[derive(Debug, Default)]
pub struct SyncSession {
    pub memory: RunMemory,
    pub tokens: TokenCache,
    pub report: SyncReport,
}

impl SyncSession {
    pub fn new() -> Self {
        Self::default()
    }

    fn finish<A: WikiApi + ?Sized>(mut self, api: &A) -> SyncReport {
        self.report.missing = self.memory.missing().len();
        self.report.rejected = self.memory.rejected().len();
        self.report.conflicts_prompted = self.memory.prompts();
        self.report.request_count = api.request_count();
        self.report
    }
}

/// Run the checkpointed pass described by `options` and report what it did.
pub fn run_sync<A, S, C>(
    api: &mut A,
    store: &mut S,
    resolver: &mut C,
    options: &SyncOptions,
) -> Result<SyncReport>
where
    A: WikiApi + ?Sized,
    S: KeyValueStore + ?Sized,
    C: ConflictResolver + ?Sized,
{
    let mut session = SyncSession::new();

    if let Some(title) = &options.single_title {
        sync_title(api, resolver, &mut session, options, title)?;
        return Ok(session.finish(api));
    }

    let keys = CheckpointKeys::for_language(&options.language);
    let mut cursor = load_checkpoint(store, &keys)?;
    if let Some(checkpoint) = &cursor {
        tracing::info!(
            language = %options.language,
            apcontinue = checkpoint.ap_continue.as_deref().unwrap_or(""),
            "resuming from stored checkpoint"
        );
    }
    session.report.resumed_from = cursor.clone();

    loop {
        if let Some(limit) = options.max_batches
            && session.report.batches >= limit
        {
            tracing::info!(batches = limit, "batch limit reached");
            break;
        }

        let batch = api.list_titles(&options.language, cursor.as_ref())?;
        session.report.batches += 1;
        let next = batch.next.filter(|checkpoint| !checkpoint.is_empty());

        if let Some(next) = &next
            && !options.dry_run
        {
            save_checkpoint(store, &keys, next)?;
        }

        for title in &batch.titles {
            sync_title(api, resolver, &mut session, options, title)?;
        }

        match next {
            Some(next) => cursor = Some(next),
            None => {
                if !options.dry_run {
                    clear_checkpoint(store, &keys)?;
                }
                session.report.exhausted = true;
                break;
            }
        }
    }

    Ok(session.finish(api))
}

/// Resolve the cluster seeded by `title` and bring every member's link block up to date.
pub fn sync_title<A, C>(
    api: &mut A,
    resolver: &mut C,
    session: &mut SyncSession,
    options: &SyncOptions,
    title: &str,
) -> Result<()>
where
    A: WikiApi + ?Sized,
    C: ConflictResolver + ?Sized,
{
    tracing::info!("Loading interwiki links for {title}");
    session.report.titles += 1;

    let seed = PageRef::new(&options.language, title);
    let cluster = resolve_cluster(api, resolver, &mut session.memory, seed)?;
    if cluster.is_empty() {
        return Ok(());
    }
    session.report.clusters += 1;

    for member in cluster.members() {
        let emitted = cluster.links_excluding(&member.page.language);
        sync_member(api, session, options, member, &emitted)?;
    }

    tracing::info!("{title} - OK");
    Ok(())
}

fn sync_member<A: WikiApi + ?Sized>(
    api: &mut A,
    session: &mut SyncSession,
    options: &SyncOptions,
    member: &ClusterMember,
    emitted: &LangLinks,
) -> Result<()> {
    let page = &member.page;
    let content = api.get_content(&page.language, &page.title)?;

    let mut stale = member.lang_links.clone();
    stale.remove(&page.language);
    let rewritten = rewrite_with_stale(&content, emitted, &stale)?;

    if rewritten == content.trim() {
        tracing::debug!(language = %page.language, title = %page.title, "links already up to date");
        session.report.pages_unchanged += 1;
        return Ok(());
    }

    if options.dry_run {
        let label = format!("{}:{}", page.language, page.title);
        let diff = TextDiff::from_lines(content.as_str(), rewritten.as_str())
            .unified_diff()
            .context_radius(2)
            .header(&label, &label)
            .to_string();
        session.report.previews.push(EditPreview {
            page: page.clone(),
            diff,
        });
        return Ok(());
    }

    save_page(api, &mut session.tokens, page, &rewritten, &options.summary)?;
    tracing::info!(language = %page.language, title = %page.title, "saved");
    session.report.pages_saved += 1;
    Ok(())
}

/// Forget the stored cursor so the next run starts from the first title.
pub fn reset_checkpoint<S: KeyValueStore + ?Sized>(store: &mut S, language: &str) -> Result<()> {
    clear_checkpoint(store, &CheckpointKeys::for_language(language))?;
    tracing::info!(language, "checkpoint cleared");
    Ok(())
}

/// Stored cursor for `language`, if a pass is in progress.
pub fn stored_checkpoint<S: KeyValueStore + ?Sized>(
    store: &S,
    language: &str,
) -> Result<Option<Checkpoint>> {
    load_checkpoint(store, &CheckpointKeys::for_language(language))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::tests::{MockWiki, cat_family};
    use crate::conflict::{KeepExistingResolver, ScriptedResolver};
    use crate::error::SyncError;
    use crate::storage::SqliteStore;

    fn options() -> SyncOptions {
        SyncOptions::new("en", "Bot: interwiki")
    }

    fn listed(mut api: MockWiki, language: &str, titles: &[&str]) -> MockWiki {
        api.listing.insert(
            language.to_string(),
            titles.iter().map(|title| title.to_string()).collect(),
        );
        api
    }

    #[test]
    fn consistent_family_gets_canonical_blocks() {
        let mut api = listed(cat_family(), "en", &["Cat"]);
        let mut store = SqliteStore::open_in_memory().expect("store");
        let mut resolver = ScriptedResolver::new();

        let report = run_sync(&mut api, &mut store, &mut resolver, &options()).expect("sync");

        assert_eq!(
            api.content_of("en", "Cat"),
            Some("Cats purr.\n\n[[de:Katze]]\n[[fr:Chat]]")
        );
        assert_eq!(
            api.content_of("fr", "Chat"),
            Some("Les chats.\n\n[[de:Katze]]\n[[en:Cat]]")
        );
        assert_eq!(
            api.content_of("de", "Katze"),
            Some("Die Katze.\n\n[[en:Cat]]\n[[fr:Chat]]")
        );
        assert_eq!(report.pages_saved, 3);
        assert_eq!(report.clusters, 1);
        assert_eq!(report.conflicts_prompted, 0);
        assert!(report.exhausted);
        assert!(resolver.presented().is_empty());
        assert_eq!(stored_checkpoint(&store, "en").expect("load"), None);
    }

    #[test]
    fn rejected_title_is_dropped_from_every_block() {
        let mut api = listed(
            cat_family()
                .page(
                    "de",
                    "Katze",
                    "Die Katze.\n[[fr:Chaton]]",
                    &[("en", "Cat"), ("fr", "Chaton")],
                )
                .page("fr", "Chaton", "Petit chat.", &[("de", "Katze")]),
            "en",
            &["Cat"],
        );
        let mut store = SqliteStore::open_in_memory().expect("store");
        let mut resolver = ScriptedResolver::new().prefer("fr", "Chat");

        let report = run_sync(&mut api, &mut store, &mut resolver, &options()).expect("sync");

        assert_eq!(
            api.content_of("de", "Katze"),
            Some("Die Katze.\n\n[[en:Cat]]\n[[fr:Chat]]")
        );
        assert_eq!(api.content_of("fr", "Chaton"), Some("Petit chat."));
        assert_eq!(api.lookups_of("fr", "Chaton"), 0);
        assert_eq!(report.rejected, 1);
        assert_eq!(report.conflicts_prompted, 1);
    }

    #[test]
    fn missing_title_is_excluded_and_not_requeried() {
        let mut api = listed(
            MockWiki::default()
                .page("en", "Cat", "Cats purr.", &[("fr", "Chat"), ("de", "Katze")])
                .page("de", "Katze", "Die Katze.", &[("en", "Cat"), ("fr", "Chat")]),
            "en",
            &["Cat"],
        );
        let mut store = SqliteStore::open_in_memory().expect("store");

        let report =
            run_sync(&mut api, &mut store, &mut ScriptedResolver::new(), &options()).expect("sync");

        assert_eq!(api.content_of("en", "Cat"), Some("Cats purr.\n\n[[de:Katze]]"));
        assert_eq!(api.content_of("de", "Katze"), Some("Die Katze.\n\n[[en:Cat]]"));
        assert_eq!(api.lookups_of("fr", "Chat"), 1);
        assert_eq!(report.missing, 1);
    }

    #[test]
    fn interrupted_run_resumes_after_last_persisted_batch() {
        let mut api = MockWiki::default();
        for title in ["A", "B", "C", "D", "E"] {
            api = api.page("en", title, title, &[]);
        }
        let mut api = listed(api, "en", &["A", "B", "C", "D", "E"]);
        api.batch_size = 2;
        api.fail_list_after = Some(2);
        let mut store = SqliteStore::open_in_memory().expect("store");

        run_sync(&mut api, &mut store, &mut KeepExistingResolver, &options())
            .expect_err("listing fails on the third batch");
        let stored = stored_checkpoint(&store, "en").expect("load").expect("checkpoint");
        assert_eq!(stored.ap_continue.as_deref(), Some("E"));

        api.fail_list_after = None;
        let report =
            run_sync(&mut api, &mut store, &mut KeepExistingResolver, &options()).expect("resume");

        assert_eq!(report.resumed_from, Some(stored.clone()));
        assert_eq!(api.list_calls.last(), Some(&Some(stored)));
        assert_eq!(report.titles, 1);
        for title in ["A", "B", "C", "D", "E"] {
            assert_eq!(api.lookups_of("en", title), 1, "{title} visited twice");
        }
        assert!(report.exhausted);
        assert_eq!(stored_checkpoint(&store, "en").expect("load"), None);
    }

    #[test]
    fn batch_limit_leaves_checkpoint_for_next_run() {
        let mut api = MockWiki::default();
        for title in ["A", "B", "C"] {
            api = api.page("en", title, title, &[]);
        }
        let mut api = listed(api, "en", &["A", "B", "C"]);
        api.batch_size = 1;
        let mut store = SqliteStore::open_in_memory().expect("store");
        let mut limited = options();
        limited.max_batches = Some(2);

        let report = run_sync(&mut api, &mut store, &mut KeepExistingResolver, &limited).expect("sync");

        assert_eq!(report.batches, 2);
        assert!(!report.exhausted);
        let stored = stored_checkpoint(&store, "en").expect("load").expect("checkpoint");
        assert_eq!(stored.ap_continue.as_deref(), Some("C"));
    }

    #[test]
    fn rejected_edit_aborts_the_run() {
        let mut api = listed(cat_family(), "en", &["Cat"]);
        api.reject_edits = true;
        let mut store = SqliteStore::open_in_memory().expect("store");

        let error = run_sync(&mut api, &mut store, &mut KeepExistingResolver, &options())
            .expect_err("edit rejected");
        assert!(matches!(
            error.downcast_ref::<SyncError>(),
            Some(SyncError::EditRejected { .. })
        ));
        assert!(api.edits.is_empty());
    }

    #[test]
    fn tokens_are_fetched_once_per_language() {
        let mut api = listed(
            cat_family()
                .page("en", "Dog", "Dogs bark.", &[("fr", "Chien")])
                .page("fr", "Chien", "Les chiens.", &[("en", "Dog")]),
            "en",
            &["Cat", "Dog"],
        );
        let mut store = SqliteStore::open_in_memory().expect("store");

        let report =
            run_sync(&mut api, &mut store, &mut KeepExistingResolver, &options()).expect("sync");

        assert_eq!(report.pages_saved, 5);
        for language in ["de", "en", "fr"] {
            let fetched = api
                .token_requests
                .iter()
                .filter(|requested| requested.as_str() == language)
                .count();
            assert_eq!(fetched, 1, "token for {language}");
        }
    }

    #[test]
    fn dry_run_previews_without_writing() {
        let mut api = listed(cat_family(), "en", &["Cat"]);
        api.batch_size = 1;
        let mut store = SqliteStore::open_in_memory().expect("store");
        let mut dry = options();
        dry.dry_run = true;

        let report = run_sync(&mut api, &mut store, &mut KeepExistingResolver, &dry).expect("sync");

        assert!(api.edits.is_empty());
        assert!(api.token_requests.is_empty());
        assert_eq!(api.content_of("en", "Cat"), Some("Cats purr."));
        assert_eq!(report.previews.len(), 3);
        assert!(report.previews[1].diff.contains("+[[fr:Chat]]"));
        assert_eq!(stored_checkpoint(&store, "en").expect("load"), None);
    }

    #[test]
    fn second_run_saves_nothing() {
        let mut api = listed(cat_family(), "en", &["Cat"]);
        let mut store = SqliteStore::open_in_memory().expect("store");
        run_sync(&mut api, &mut store, &mut KeepExistingResolver, &options()).expect("first");

        let report =
            run_sync(&mut api, &mut store, &mut KeepExistingResolver, &options()).expect("second");
        assert_eq!(report.pages_saved, 0);
        assert_eq!(report.pages_unchanged, 3);
        assert_eq!(api.edits.len(), 3);
    }

    #[test]
    fn single_title_mode_skips_listing_and_checkpoint() {
        let mut api = cat_family();
        let mut store = SqliteStore::open_in_memory().expect("store");
        store.set("interwiki.fr.apcontinue", "Chien").expect("seed");
        let mut single = SyncOptions::new("fr", "Bot: interwiki");
        single.single_title = Some("Chat".to_string());

        let report =
            run_sync(&mut api, &mut store, &mut KeepExistingResolver, &single).expect("sync");

        assert!(api.list_calls.is_empty());
        assert_eq!(report.pages_saved, 3);
        assert_eq!(
            store.get("interwiki.fr.apcontinue").expect("get").as_deref(),
            Some("Chien")
        );
    }

    #[test]
    fn reset_forgets_only_that_language() {
        let mut store = SqliteStore::open_in_memory().expect("store");
        store.set("interwiki.en.apcontinue", "Dog").expect("set");
        store.set("interwiki.fr.apcontinue", "Chien").expect("set");

        reset_checkpoint(&mut store, "en").expect("reset");

        assert_eq!(stored_checkpoint(&store, "en").expect("load"), None);
        assert!(stored_checkpoint(&store, "fr").expect("load").is_some());
    }
}
