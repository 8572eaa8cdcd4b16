//! Process-lifetime cache of user display metadata.

use std::{
    collections::{BTreeSet, HashMap},
    sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock},
};

use futures::{
    future::{join_all, BoxFuture, Shared},
    FutureExt,
};
use shared::{domain::UserId, protocol::ProfilePayload};
use tracing::{debug, warn};

use crate::{api::ChatApi, model::UserProfile};

pub const DEFAULT_AVATAR_URL: &str = "/default-avatar.png";
pub const UNKNOWN_USERNAME: &str = "Unknown";

/// Server marker for a user who never uploaded a picture.
const UNSET_AVATAR: &str = "/Uploads/undefined";

pub fn placeholder_profile(id: &UserId) -> UserProfile {
    UserProfile {
        id: id.clone(),
        username: UNKNOWN_USERNAME.to_string(),
        avatar_url: DEFAULT_AVATAR_URL.to_string(),
    }
}

/// Maps a raw avatar reference to something renderable: the default avatar
/// when unset, absolute URLs as-is, relative paths joined onto `base_url`.
pub fn normalize_avatar(base_url: &str, raw: Option<&str>) -> String {
    let raw = raw.map(str::trim).unwrap_or_default();
    if raw.is_empty() || raw == UNSET_AVATAR {
        return DEFAULT_AVATAR_URL.to_string();
    }
    if raw.starts_with("http://") || raw.starts_with("https://") {
        return raw.to_string();
    }
    let base = base_url.trim_end_matches('/');
    if raw.starts_with('/') {
        format!("{base}{raw}")
    } else {
        format!("{base}/{raw}")
    }
}

/// A profile fetch shared by every caller waiting on the same id. `None`
/// when the lookup failed.
type ProfileLookup = Shared<BoxFuture<'static, Option<UserProfile>>>;

type Profiles = Arc<RwLock<HashMap<UserId, UserProfile>>>;
type InFlight = Arc<Mutex<HashMap<UserId, ProfileLookup>>>;

pub struct UserDirectoryCache {
    api: Arc<dyn ChatApi>,
    base_url: String,
    profiles: Profiles,
    in_flight: InFlight,
}

fn pending(
    in_flight: &Mutex<HashMap<UserId, ProfileLookup>>,
) -> MutexGuard<'_, HashMap<UserId, ProfileLookup>> {
    in_flight.lock().unwrap_or_else(PoisonError::into_inner)
}

impl UserDirectoryCache {
    pub fn new(api: Arc<dyn ChatApi>, base_url: impl Into<String>) -> Self {
        Self {
            api,
            base_url: base_url.into(),
            profiles: Arc::new(RwLock::new(HashMap::new())),
            in_flight: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Profiles for `ids`. Uncached ids are fetched in one concurrent round,
    /// joining any lookup another caller already started; ids that fail come
    /// back as placeholders and are retried next time.
    pub async fn resolve(&self, ids: &[UserId]) -> HashMap<UserId, UserProfile> {
        let wanted: BTreeSet<&UserId> = ids.iter().filter(|id| !id.is_empty()).collect();
        let mut out = HashMap::with_capacity(wanted.len());
        let mut lookups = Vec::new();
        {
            // Completed lookups fill the cache while holding this lock, so
            // the cache check below cannot miss one that just finished.
            let mut in_flight = pending(&self.in_flight);
            let cache = self.profiles.read().unwrap_or_else(PoisonError::into_inner);
            for id in wanted {
                if let Some(profile) = cache.get(id) {
                    out.insert(id.clone(), profile.clone());
                    continue;
                }
                let lookup = in_flight
                    .entry(id.clone())
                    .or_insert_with(|| self.lookup(id.clone()))
                    .clone();
                lookups.push((id.clone(), lookup));
            }
        }
        if lookups.is_empty() {
            return out;
        }

        debug!(count = lookups.len(), "directory: resolving profiles");
        let results = join_all(
            lookups
                .into_iter()
                .map(|(id, lookup)| async move { (id, lookup.await) }),
        )
        .await;
        for (id, profile) in results {
            let profile = profile.unwrap_or_else(|| placeholder_profile(&id));
            out.insert(id, profile);
        }
        out
    }

    /// Cached profile or placeholder. Never performs I/O.
    pub fn display(&self, id: &UserId) -> UserProfile {
        self.cached(id).unwrap_or_else(|| placeholder_profile(id))
    }

    pub fn cached(&self, id: &UserId) -> Option<UserProfile> {
        self.profiles
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(id)
            .cloned()
    }

    pub fn len(&self) -> usize {
        self.profiles
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lookup(&self, id: UserId) -> ProfileLookup {
        let api = Arc::clone(&self.api);
        let profiles = Arc::clone(&self.profiles);
        let in_flight = Arc::clone(&self.in_flight);
        let base_url = self.base_url.clone();

        async move {
            let result = api.profile(&id).await;
            let mut waiting = pending(&in_flight);
            waiting.remove(&id);
            match result {
                Ok(payload) => {
                    let profile = to_profile(&base_url, &id, payload);
                    profiles
                        .write()
                        .unwrap_or_else(PoisonError::into_inner)
                        .insert(id, profile.clone());
                    Some(profile)
                }
                Err(err) => {
                    warn!(user_id = %id, error = %err, "directory: profile lookup failed");
                    None
                }
            }
        }
        .boxed()
        .shared()
    }
}

fn to_profile(base_url: &str, requested: &UserId, payload: ProfilePayload) -> UserProfile {
    let username = if payload.username.trim().is_empty() {
        UNKNOWN_USERNAME.to_string()
    } else {
        payload.username
    };
    UserProfile {
        id: requested.clone(),
        username,
        avatar_url: normalize_avatar(base_url, payload.avatar_url.as_deref()),
    }
}

#[cfg(test)]
#[path = "tests/directory_tests.rs"]
mod tests;
