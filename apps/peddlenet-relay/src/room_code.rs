use std::sync::Arc;

use dashmap::DashMap;
use thiserror::Error;
use tracing::debug;

/// Word lists for human-memorable room codes. Changing either list changes
/// every derived code, so both are fixed and pinned by tests.
const ADJECTIVES: [&str; 16] = [
    "blue", "red", "gold", "neon", "cosmic", "electric", "misty", "wild", "silver", "lucky",
    "midnight", "sunny", "velvet", "echo", "crystal", "rebel",
];

const NOUNS: [&str; 16] = [
    "stage", "tent", "field", "camp", "groove", "beat", "wave", "fire", "moon", "star", "gate",
    "river", "meadow", "lantern", "drum", "horizon",
];

/// Derive the short code for a room id.
///
/// The hash is 32-bit signed arithmetic with wraparound over the UTF-16 code
/// units of the id, so independently deployed relays (and the JS clients)
/// agree on the code without coordination.
pub fn derive_code(room_id: &str) -> String {
    let mut hash: i32 = 0;
    for unit in room_id.encode_utf16() {
        hash = hash.wrapping_mul(31).wrapping_add(unit as i32);
    }

    let adjective = ADJECTIVES[hash.unsigned_abs() as usize % ADJECTIVES.len()];
    let noun_index = (hash as i64).div_euclid(ADJECTIVES.len() as i64).unsigned_abs() as usize
        % NOUNS.len();
    let noun = NOUNS[noun_index];
    let number = hash.unsigned_abs() % 99 + 1;

    format!("{}-{}-{}", adjective, noun, number)
}

fn normalize(code: &str) -> String {
    code.trim().to_lowercase()
}

#[derive(Debug, Error)]
#[error("code {code} already maps to room {existing_room_id}")]
pub struct CodeConflict {
    pub code: String,
    pub existing_room_id: String,
}

/// Registered code mappings. Codes never expire; they are dropped only by a
/// full administrative wipe.
#[derive(Clone, Default)]
pub struct RoomCodeMap {
    codes: Arc<DashMap<String, String>>,
    rooms: Arc<DashMap<String, String>>,
}

impl RoomCodeMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert an explicit mapping. Re-registering the same pair is
    /// idempotent; mapping an existing code to a different room is a
    /// conflict unless `overwrite` is set.
    pub fn register(&self, room_id: &str, code: &str, overwrite: bool) -> Result<(), CodeConflict> {
        let code = normalize(code);
        if let Some(existing) = self.codes.get(&code) {
            if existing.value() == room_id {
                return Ok(());
            }
            if !overwrite {
                return Err(CodeConflict {
                    code,
                    existing_room_id: existing.value().clone(),
                });
            }
        }
        self.codes.insert(code.clone(), room_id.to_string());
        self.rooms.insert(room_id.to_string(), code);
        Ok(())
    }

    /// Derive and register the canonical code for a room. First mapping
    /// wins; a hash collision with an already registered code leaves the
    /// earlier room in place.
    pub fn register_derived(&self, room_id: &str) -> String {
        let code = derive_code(room_id);
        if let Err(conflict) = self.register(room_id, &code, false) {
            debug!(
                room = %room_id,
                code = %conflict.code,
                existing = %conflict.existing_room_id,
                "derived room code collides with existing registration"
            );
        }
        code
    }

    /// Resolve a code to its room id.
    ///
    /// On a direct miss this falls back to a compatibility shim: rebuild a
    /// small set of candidate room ids from the code's words and accept the
    /// first whose derived code matches. Old clients joined rooms before
    /// registering codes, so their rooms can still be found after a restart.
    pub fn resolve(&self, code: &str) -> Option<String> {
        let code = normalize(code);
        if let Some(room_id) = self.codes.get(&code) {
            return Some(room_id.value().clone());
        }

        for candidate in reverse_candidates(&code) {
            if derive_code(&candidate) == code {
                debug!(code = %code, room = %candidate, "resolved code via derivation shim");
                let _ = self.register(&candidate, &code, false);
                return Some(candidate);
            }
        }
        None
    }

    pub fn code_for_room(&self, room_id: &str) -> Option<String> {
        self.rooms.get(room_id).map(|entry| entry.value().clone())
    }

    pub fn len(&self) -> usize {
        self.codes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.codes.is_empty()
    }

    pub fn reset(&self) {
        self.codes.clear();
        self.rooms.clear();
    }
}

/// Candidate room ids a code might have been derived from. Bounded and
/// purely heuristic; the caller verifies each candidate by re-deriving.
fn reverse_candidates(code: &str) -> Vec<String> {
    let parts: Vec<&str> = code.split('-').collect();
    if parts.len() != 3 {
        return Vec::new();
    }
    let (adjective, noun, number) = (parts[0], parts[1], parts[2]);
    vec![
        noun.to_string(),
        format!("{}-{}", adjective, noun),
        format!("{}-{}", noun, number),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn derivation_is_stable() {
        let first = derive_code("main-stage");
        let second = derive_code("main-stage");
        assert_eq!(first, second);
    }

    #[test]
    fn derivation_known_answers() {
        // Pinned against the JS client's ((hash << 5) - hash) + charCode
        // with 32-bit truncation and Math.floor division.
        assert_eq!(derive_code("a"), "red-wave-98");
        assert_eq!(derive_code("ab"), "red-field-37");
        assert_eq!(derive_code("main-stage"), "misty-field-47");
    }

    #[test]
    fn registered_code_resolves_to_room() {
        let map = RoomCodeMap::new();
        for room in ["main-stage", "chill-tent", "food-court", "vip"] {
            let code = map.register_derived(room);
            assert_eq!(map.resolve(&code).as_deref(), Some(room));
            assert_eq!(map.code_for_room(room).as_deref(), Some(code.as_str()));
        }
    }

    #[test]
    fn resolve_normalizes_case_and_whitespace() {
        let map = RoomCodeMap::new();
        map.register("main-stage", "blue-stage-42", false).unwrap();
        assert_eq!(
            map.resolve("  Blue-Stage-42 ").as_deref(),
            Some("main-stage")
        );
    }

    #[test]
    fn conflicting_registration_is_rejected() {
        let map = RoomCodeMap::new();
        map.register("main-stage", "blue-stage-42", false).unwrap();
        // Same pair again is fine.
        map.register("main-stage", "blue-stage-42", false).unwrap();

        let err = map
            .register("other-room", "blue-stage-42", false)
            .unwrap_err();
        assert_eq!(err.existing_room_id, "main-stage");

        map.register("other-room", "blue-stage-42", true).unwrap();
        assert_eq!(map.resolve("blue-stage-42").as_deref(), Some("other-room"));
    }

    #[test]
    fn reverse_candidates_are_bounded() {
        let candidates = reverse_candidates("blue-stage-42");
        assert_eq!(candidates, vec!["stage", "blue-stage", "stage-42"]);
        assert!(reverse_candidates("garbage").is_empty());
        assert!(reverse_candidates("one-two-three-four-5").is_empty());
    }

    #[test]
    fn shim_never_fabricates_a_room() {
        let map = RoomCodeMap::new();
        // Whatever the shim returns for an unregistered code must re-derive
        // to exactly that code; anything else is a miss.
        for code in ["blue-stage-1", "misty-field-47", "gold-moon-12"] {
            if let Some(room) = map.resolve(code) {
                assert_eq!(derive_code(&room), code);
            }
        }
        assert!(map.resolve("garbage").is_none());
    }
}
