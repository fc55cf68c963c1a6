//! Per-App Routing Policy
//!
//! Decides which applications the virtual interface carries. An empty
//! selection means "route everything"; otherwise only the selected apps go
//! through the tunnel. The manager itself is never tunnelled, otherwise its
//! own control traffic would loop back into the interface.
//!
//! Hosts that cannot filter by application fall back to domain routing:
//! [`AppDomainMap`] turns an allow list into the domains those apps talk to.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// Set of selected application identifiers
///
/// Order is irrelevant and duplicates collapse. Identifiers are opaque and
/// kept verbatim.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AppSelection(BTreeSet<String>);

impl AppSelection {
    /// Empty selection (route all traffic)
    pub fn all() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.0.contains(id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.0.iter().map(String::as_str)
    }
}

impl<S: Into<String>> FromIterator<S> for AppSelection {
    fn from_iter<I: IntoIterator<Item = S>>(iter: I) -> Self {
        Self(iter.into_iter().map(Into::into).collect())
    }
}

/// Routing decision applied to the virtual interface
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "mode", content = "apps", rename_all = "camelCase")]
pub enum RoutingDecision {
    /// No per-app restriction
    AllowAll,
    /// Only these apps are routed through the tunnel
    AllowList(BTreeSet<String>),
}

impl RoutingDecision {
    /// Whether traffic from `id` goes through the tunnel
    pub fn routes(&self, id: &str) -> bool {
        match self {
            RoutingDecision::AllowAll => true,
            RoutingDecision::AllowList(ids) => ids.contains(id),
        }
    }

    /// Number of explicitly allowed apps (0 for `AllowAll`)
    pub fn allowed_count(&self) -> usize {
        match self {
            RoutingDecision::AllowAll => 0,
            RoutingDecision::AllowList(ids) => ids.len(),
        }
    }
}

/// Derive the routing decision for a selection
///
/// `self_identifier` is dropped from any allow list.
pub fn derive(selection: &AppSelection, self_identifier: &str) -> RoutingDecision {
    if selection.is_empty() {
        return RoutingDecision::AllowAll;
    }

    RoutingDecision::AllowList(
        selection
            .iter()
            .filter(|id| *id != self_identifier)
            .map(String::from)
            .collect(),
    )
}

/// Well-known apps and the domains their traffic goes to
///
/// Each row lists the identifiers the app ships under on different
/// platforms, then its domains.
const BUILTIN_DOMAINS: &[(&[&str], &[&str])] = &[
    (
        &["com.instagram.android", "com.burbn.instagram"],
        &["instagram.com", "cdninstagram.com", "facebook.com", "instagramstatic-a.akamaihd.net"],
    ),
    (
        &["com.snapchat.android", "com.snapchat.Snapchat"],
        &["snapchat.com", "sc-cdn.net", "snap-dev.net", "snapkit.com", "snap.com"],
    ),
    (
        &["com.zhiliaoapp.musically"],
        &["tiktok.com", "muscdn.com", "musical.ly", "byteoversea.com", "tiktokcdn.com"],
    ),
    (
        &["com.twitter.android", "com.twitter.app"],
        &["twitter.com", "twimg.com", "t.co", "twitterstatus.com"],
    ),
    (
        &["com.facebook.katana", "com.facebook.Facebook"],
        &["facebook.com", "fbcdn.net", "fb.com", "facebook.net", "fbsbx.com"],
    ),
    (
        &["com.whatsapp", "net.whatsapp.WhatsApp"],
        &["whatsapp.com", "whatsapp.net", "wa.me"],
    ),
    (
        &["com.discord"],
        &["discord.com", "discordapp.com", "discord.gg", "discord.media"],
    ),
    (
        &["org.telegram.messenger", "ph.telegra.Telegraph"],
        &["telegram.org", "t.me", "telegra.ph", "telegram.me"],
    ),
    (
        &["com.spotify.music", "com.spotify.client"],
        &["spotify.com", "scdn.co", "spotifycdn.com"],
    ),
    (
        &["com.netflix.mediaclient", "com.netflix.Netflix"],
        &["netflix.com", "nflxso.net", "nflxext.com", "nflximg.net", "nflxvideo.net"],
    ),
    (
        &["com.google.android.youtube", "com.google.ios.youtube"],
        &["youtube.com", "youtubei.googleapis.com", "ytimg.com", "googlevideo.com", "youtube-nocookie.com"],
    ),
    (
        &["com.epicgames.fortnite", "com.epicgames.FortniteGame"],
        &["epicgames.com", "fortnite.com", "unrealengine.com"],
    ),
    (
        &["com.riotgames.league.wildrift", "com.riotgames.leagueoflegends"],
        &["riotgames.com", "leagueoflegends.com", "riot.net", "riotcdn.net"],
    ),
];

/// Routed when none of the selected apps has known domains
const POPULAR_DOMAINS: &[&str] = &[
    "facebook.com",
    "instagram.com",
    "twitter.com",
    "snapchat.com",
    "tiktok.com",
    "youtube.com",
    "fbcdn.net",
    "cdninstagram.com",
    "twimg.com",
    "ytimg.com",
    "googlevideo.com",
    "scdn.co",
    "whatsapp.com",
    "discord.com",
    "telegram.org",
];

fn normalize(domain: &str) -> String {
    domain.trim().trim_end_matches('.').to_ascii_lowercase()
}

/// Application identifier to domain mapping
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AppDomainMap {
    apps: BTreeMap<String, BTreeSet<String>>,
    fallback: BTreeSet<String>,
}

impl AppDomainMap {
    /// Mapping for popular apps, with the popular-domain fallback
    pub fn builtin() -> Self {
        let mut map = Self {
            apps: BTreeMap::new(),
            fallback: POPULAR_DOMAINS.iter().map(|d| normalize(d)).collect(),
        };
        for (ids, domains) in BUILTIN_DOMAINS {
            for id in *ids {
                map = map.with_app(*id, domains.iter().copied());
            }
        }
        map
    }

    /// Add domains for an app, merging with any already known
    pub fn with_app<I, S>(mut self, id: impl Into<String>, domains: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let entry = self.apps.entry(id.into()).or_default();
        entry.extend(
            domains
                .into_iter()
                .map(|d| normalize(d.as_ref()))
                .filter(|d| !d.is_empty()),
        );
        self
    }

    /// Domains known for one app
    pub fn domains_for(&self, id: &str) -> Option<&BTreeSet<String>> {
        self.apps.get(id)
    }

    /// Domains to route for a decision
    ///
    /// Empty for `AllowAll` and for an empty allow list. An allow list whose
    /// apps are all unknown gets the popular-domain fallback.
    pub fn split_domains(&self, decision: &RoutingDecision) -> BTreeSet<String> {
        if decision.allowed_count() == 0 {
            return BTreeSet::new();
        }

        let domains: BTreeSet<String> = self
            .apps
            .iter()
            .filter(|(id, _)| decision.routes(id))
            .flat_map(|(_, domains)| domains.iter().cloned())
            .collect();

        if domains.is_empty() {
            self.fallback.clone()
        } else {
            domains
        }
    }

    /// Whether `domain` (or a parent of it) belongs to a routed app
    pub fn is_app_domain(&self, domain: &str, decision: &RoutingDecision) -> bool {
        let domain = normalize(domain);
        self.split_domains(decision).iter().any(|known| {
            domain == *known
                || domain
                    .strip_suffix(known.as_str())
                    .is_some_and(|prefix| prefix.ends_with('.'))
        })
    }
}
