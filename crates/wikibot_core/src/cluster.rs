//! Discovery of the set of corresponding articles across language editions.
//!
//! A cluster is grown from a seed page by following language links with an
//! explicit stack. Each `(language, title)` is fetched at most once per
//! resolution: once it holds a language slot, or sits in the rejected or
//! missing set, it is never queried again, which also breaks cycles in the
//! link graph. The rejected and missing sets live for the whole run.

use std::collections::{BTreeMap, BTreeSet};

use anyhow::Result;
use serde::Serialize;

use crate::api::{PageLookup, WikiApi};
use crate::conflict::{Choice, Conflict, ConflictResolver};

/// Language code to linked title, as reported by one page.
pub type LangLinks = BTreeMap<String, String>;

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct PageRef {
    pub language: String,
    pub title: String,
}

impl PageRef {
    pub fn new(language: impl Into<String>, title: impl Into<String>) -> Self {
        Self {
            language: language.into(),
            title: title.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClusterMember {
    pub page: PageRef,
    /// Links the page itself reported when it was fetched.
    pub lang_links: LangLinks,
}

/// At most one member per language.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Cluster {
    members: BTreeMap<String, ClusterMember>,
}

impl Cluster {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, member: ClusterMember) -> Option<ClusterMember> {
        self.members.insert(member.page.language.clone(), member)
    }

    pub fn remove(&mut self, language: &str) -> Option<ClusterMember> {
        self.members.remove(language)
    }

    pub fn title_of(&self, language: &str) -> Option<&str> {
        self.members
            .get(language)
            .map(|member| member.page.title.as_str())
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    /// Members ordered by language code.
    pub fn members(&self) -> impl Iterator<Item = &ClusterMember> {
        self.members.values()
    }

    /// The canonical link set for the member in `language`: every other member.
    pub fn links_excluding(&self, language: &str) -> LangLinks {
        self.members
            .iter()
            .filter(|(code, _)| code.as_str() != language)
            .map(|(code, member)| (code.clone(), member.page.title.clone()))
            .collect()
    }
}

/// Run-scoped memory shared by every cluster resolution of one sync run.
#[derive(Debug, Clone, Default)]
pub struct RunMemory {
    rejected: BTreeSet<PageRef>,
    missing: BTreeSet<PageRef>,
    decisions: BTreeMap<(String, String, String), String>,
    prompts: usize,
}

impl RunMemory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_rejected(&self, page: &PageRef) -> bool {
        self.rejected.contains(page)
    }

    pub fn reject(&mut self, page: PageRef) {
        self.rejected.insert(page);
    }

    pub fn is_missing(&self, page: &PageRef) -> bool {
        self.missing.contains(page)
    }

    pub fn mark_missing(&mut self, page: PageRef) {
        self.missing.insert(page);
    }

    pub fn rejected(&self) -> &BTreeSet<PageRef> {
        &self.rejected
    }

    pub fn missing(&self) -> &BTreeSet<PageRef> {
        &self.missing
    }

    /// Number of conflicts that actually reached the resolver.
    pub fn prompts(&self) -> usize {
        self.prompts
    }

    /// Resolve a conflict, asking `resolver` only for pairs not decided earlier in the run.
    pub fn decide<C>(&mut self, conflict: &Conflict, resolver: &mut C) -> Result<Choice>
    where
        C: ConflictResolver + ?Sized,
    {
        let key = decision_key(conflict);
        if let Some(choice) = self
            .decisions
            .get(&key)
            .and_then(|winner| conflict.choice_for(winner))
        {
            tracing::debug!(language = %conflict.language, "conflict already decided this run");
            return Ok(choice);
        }

        let choice = resolver.choose(conflict)?;
        self.prompts += 1;
        self.decisions
            .insert(key, conflict.winner(choice).to_string());
        Ok(choice)
    }
}

fn decision_key(conflict: &Conflict) -> (String, String, String) {
    let (first, second) = if conflict.existing <= conflict.candidate {
        (&conflict.existing, &conflict.candidate)
    } else {
        (&conflict.candidate, &conflict.existing)
    };
    (conflict.language.clone(), first.clone(), second.clone())
}

/// Build the cluster reachable from `seed`.
pub fn resolve_cluster<A, C>(
    api: &mut A,
    resolver: &mut C,
    memory: &mut RunMemory,
    seed: PageRef,
) -> Result<Cluster>
where
    A: WikiApi + ?Sized,
    C: ConflictResolver + ?Sized,
{
    let mut cluster = Cluster::new();
    expand_cluster(api, resolver, memory, seed, &mut cluster)?;
    Ok(cluster)
}

/// Grow `cluster` from `seed`, sharing the run's rejected and missing sets.
pub fn expand_cluster<A, C>(
    api: &mut A,
    resolver: &mut C,
    memory: &mut RunMemory,
    seed: PageRef,
    cluster: &mut Cluster,
) -> Result<()>
where
    A: WikiApi + ?Sized,
    C: ConflictResolver + ?Sized,
{
    if memory.is_missing(&seed) {
        return Ok(());
    }

    // Slots are claimed when a link is discovered, before the traversal descends, so a
    // page's direct links take precedence over titles reached further away.
    let mut claims: BTreeMap<String, String> = cluster
        .members()
        .map(|member| (member.page.language.clone(), member.page.title.clone()))
        .collect();
    claims.insert(seed.language.clone(), seed.title.clone());
    // Links of claimed pages fetched ahead of their turn on the stack.
    let mut fetched: BTreeMap<PageRef, LangLinks> = BTreeMap::new();
    let mut stack = vec![seed];

    while let Some(page) = stack.pop() {
        if claims.get(&page.language) != Some(&page.title) {
            // lost its slot to a conflict decision after being queued
            continue;
        }

        let Some(links) = fetch_links(api, memory, &mut fetched, &page)? else {
            claims.remove(&page.language);
            continue;
        };

        let mut descend = Vec::new();
        for (language, title) in &links {
            if *language == page.language {
                tracing::debug!(language = %language, title = %title, "ignoring self-language link");
                continue;
            }
            let candidate = PageRef::new(language, title);
            if memory.is_rejected(&candidate) || memory.is_missing(&candidate) {
                continue;
            }
            let Some(existing) = claims.get(language).cloned() else {
                claims.insert(language.clone(), title.clone());
                descend.push(candidate);
                continue;
            };
            if existing == *title {
                continue;
            }

            // only a title known to exist can hold its slot against another
            let existing_page = PageRef::new(language, &existing);
            if cluster.title_of(language) != Some(existing.as_str())
                && fetch_links(api, memory, &mut fetched, &existing_page)?.is_none()
            {
                claims.insert(language.clone(), title.clone());
                descend.push(candidate);
                continue;
            }

            let conflict = Conflict {
                language: language.clone(),
                existing,
                candidate: title.clone(),
            };
            let choice = memory.decide(&conflict, resolver)?;
            if choice == Choice::TakeNew
                && fetch_links(api, memory, &mut fetched, &candidate)?.is_none()
            {
                continue;
            }
            tracing::info!(
                language = %conflict.language,
                kept = %conflict.winner(choice),
                dropped = %conflict.loser(choice),
                "conflict resolved"
            );
            memory.reject(PageRef::new(language, conflict.loser(choice)));
            if choice == Choice::TakeNew {
                cluster.remove(language);
                claims.insert(language.clone(), title.clone());
                descend.push(candidate);
            }
        }

        cluster.insert(ClusterMember {
            page,
            lang_links: links,
        });
        // reversed so the lowest language code is visited first
        stack.extend(descend.into_iter().rev());
    }

    Ok(())
}

/// Links of `page`, from the prefetch cache or the wiki. `None` marks the page missing.
fn fetch_links<A: WikiApi + ?Sized>(
    api: &mut A,
    memory: &mut RunMemory,
    fetched: &mut BTreeMap<PageRef, LangLinks>,
    page: &PageRef,
) -> Result<Option<LangLinks>> {
    if let Some(links) = fetched.get(page) {
        return Ok(Some(links.clone()));
    }
    match api.get_lang_links(&page.language, &page.title)? {
        PageLookup::Missing => {
            tracing::warn!(language = %page.language, title = %page.title, "page does not exist");
            memory.mark_missing(page.clone());
            Ok(None)
        }
        PageLookup::Found(links) => {
            fetched.insert(page.clone(), links.clone());
            Ok(Some(links))
        }
    }
}
