//! Per-object lock word.
//!
//! Layout of the 64-bit word:
//!
//! ```text
//! Free:      [ 0 ................................................ | 00 ]
//! Thin:      [ recursion:30 | owner:32                            | 01 ]
//! Inflated:  [ monitor index:62                                   | 10 ]
//! ```
//!
//! `recursion` counts entries beyond the first, so a word with `recursion == 0`
//! is held once.

use std::sync::atomic::{AtomicU64, Ordering};

use easy_bitfield::{BitField, BitFieldTrait};

use crate::runtime::threads::ThreadId;

pub type LockTagBitfield = BitField<u64, u64, 0, 2, false>;
pub type ThinOwnerBitfield = BitField<u64, u64, { LockTagBitfield::NEXT_BIT }, 32, false>;
pub type ThinRecursionBitfield = BitField<u64, u64, { ThinOwnerBitfield::NEXT_BIT }, 30, false>;
pub type InflatedIndexBitfield = BitField<u64, u64, { LockTagBitfield::NEXT_BIT }, 62, false>;

const TAG_FREE: u64 = 0;
const TAG_THIN: u64 = 1;
const TAG_INFLATED: u64 = 2;

/// Largest recursion a thin word can record before it must inflate.
pub const MAX_THIN_RECURSION: u32 = (1 << 30) - 1;
/// Thin words only fit owners with ids below this bound.
pub const MAX_THIN_OWNER: u64 = u32::MAX as u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockWord {
    Free,
    Thin { owner: ThreadId, recursion: u32 },
    Inflated { index: u32 },
}

impl LockWord {
    pub fn encode(self) -> u64 {
        match self {
            Self::Free => LockTagBitfield::encode(TAG_FREE),
            Self::Thin { owner, recursion } => {
                let word = LockTagBitfield::encode(TAG_THIN);
                let word = ThinOwnerBitfield::update(owner.as_u64(), word);
                ThinRecursionBitfield::update(recursion as u64, word)
            }
            Self::Inflated { index } => {
                InflatedIndexBitfield::update(index as u64, LockTagBitfield::encode(TAG_INFLATED))
            }
        }
    }

    /// Decode a raw word. `None` for bit patterns no writer produces.
    pub fn decode(word: u64) -> Option<Self> {
        match LockTagBitfield::decode(word) {
            TAG_FREE if word == 0 => Some(Self::Free),
            TAG_THIN => {
                let owner = ThreadId::from_u64(ThinOwnerBitfield::decode(word))?;
                Some(Self::Thin {
                    owner,
                    recursion: ThinRecursionBitfield::decode(word) as u32,
                })
            }
            TAG_INFLATED => {
                let index = InflatedIndexBitfield::decode(word);
                if index == 0 || index > u32::MAX as u64 {
                    return None;
                }
                Some(Self::Inflated {
                    index: index as u32,
                })
            }
            _ => None,
        }
    }

    pub fn is_free(&self) -> bool {
        matches!(self, Self::Free)
    }

    pub fn is_inflated(&self) -> bool {
        matches!(self, Self::Inflated { .. })
    }

    /// Thin owner, if any.
    pub fn thin_owner(&self) -> Option<ThreadId> {
        match self {
            Self::Thin { owner, .. } => Some(*owner),
            _ => None,
        }
    }
}

/// Atomic storage for a [`LockWord`], embedded in object headers.
pub struct LockWordCell {
    word: AtomicU64,
}

impl LockWordCell {
    pub const fn new() -> Self {
        Self {
            word: AtomicU64::new(0),
        }
    }

    pub fn load(&self) -> LockWord {
        let raw = self.word.load(Ordering::Acquire);
        match LockWord::decode(raw) {
            Some(word) => word,
            None => crate::error::fatal!("corrupted lock word {:#x}", raw),
        }
    }

    /// Strong CAS. On failure returns the word actually observed.
    pub fn compare_exchange(&self, current: LockWord, new: LockWord) -> Result<(), LockWord> {
        self.word
            .compare_exchange(
                current.encode(),
                new.encode(),
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .map(|_| ())
            .map_err(|observed| match LockWord::decode(observed) {
                Some(word) => word,
                None => crate::error::fatal!("corrupted lock word {:#x}", observed),
            })
    }

    /// Only valid for the owner of a thin word or for a word nobody else can see.
    pub fn store(&self, word: LockWord) {
        self.word.store(word.encode(), Ordering::Release);
    }
}

impl Default for LockWordCell {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for LockWordCell {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("LockWordCell").field(&self.load()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tid(id: u64) -> ThreadId {
        ThreadId::from_u64(id).unwrap()
    }

    #[test]
    fn word_layout() {
        assert_eq!(LockWord::Free.encode(), 0);

        let thin = LockWord::Thin {
            owner: tid(7),
            recursion: 3,
        };
        assert_eq!(thin.encode(), 1 | (7 << 2) | (3 << 34));
        assert_eq!(LockWord::decode(thin.encode()), Some(thin));

        let max = LockWord::Thin {
            owner: tid(MAX_THIN_OWNER),
            recursion: MAX_THIN_RECURSION,
        };
        assert_eq!(LockWord::decode(max.encode()), Some(max));

        let inflated = LockWord::Inflated { index: 12 };
        assert_eq!(inflated.encode(), 2 | (12 << 2));
        assert!(LockWord::decode(inflated.encode()).unwrap().is_inflated());
    }

    #[test]
    fn invalid_words() {
        // tag 3
        assert_eq!(LockWord::decode(3), None);
        // thin word with owner 0
        assert_eq!(LockWord::decode(1), None);
        // inflated word pointing at the reserved slot
        assert_eq!(LockWord::decode(2), None);
        // free tag with garbage payload
        assert_eq!(LockWord::decode(4), None);
    }

    #[test]
    fn cell_cas() {
        let cell = LockWordCell::new();
        let thin = LockWord::Thin {
            owner: tid(1),
            recursion: 0,
        };
        assert_eq!(cell.compare_exchange(LockWord::Free, thin), Ok(()));
        assert_eq!(cell.compare_exchange(LockWord::Free, thin), Err(thin));
        assert_eq!(cell.load().thin_owner(), Some(tid(1)));
        cell.store(LockWord::Free);
        assert!(cell.load().is_free());
    }
}
