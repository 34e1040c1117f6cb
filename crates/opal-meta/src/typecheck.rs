//! Open-world type-check encoding
//!
//! Computes the interface-dispatch data attached to a type: a linear table
//! of (interface id, itable offset) pairs that covers every implemented
//! interface, plus (when interface hashing is enabled) a perfect hash
//! table over the interfaces whose id fits below the configured ceiling.
//! A hash probe answers the common interface check in O(1); anything the
//! table cannot hold falls back to the short linear scan.

use rustc_hash::FxHashSet;

use crate::error::MetaError;

/// Mask field width of a hash parameter
const PARAM_MASK_BITS: u32 = 24;
const PARAM_MASK: u32 = (1 << PARAM_MASK_BITS) - 1;

/// Widest itable offset a packed hash entry can hold
const HASHED_OFFSET_MAX: u32 = 0xFFFF;

/// Widest interface id a packed hash entry can hold
const HASHED_ID_MAX: u32 = 0xFFFF;

/// One entry of the linear interface table
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InterfaceSlot {
    /// Id of the implemented interface
    pub interface_id: u32,

    /// Byte offset of the interface's itable within the type's vtable area
    pub itable_offset: u32,
}

/// Global interface hashing configuration, fixed per build
#[derive(Debug, Clone, Copy)]
pub struct HashingConfig {
    /// Whether hashed interface checks are enabled at all
    pub enabled: bool,

    /// Largest interface id eligible for hashing
    pub id_ceiling: u32,
}

impl Default for HashingConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            id_ceiling: 1023,
        }
    }
}

/// Per-type input to the encoder
#[derive(Debug, Clone)]
pub struct TypeCheckInput<'a> {
    /// Whether the type has dispatchable methods (a vtable) at all
    pub implements_methods: bool,

    /// Ancestor class type ids, root first, the type itself last
    pub ancestor_ids: &'a [u32],

    /// Ids of all implemented interfaces
    pub interface_ids: &'a [u32],

    /// Per-interface itable start, as a vtable entry index
    pub itable_starts: &'a [u32],

    /// Byte offset of the vtable area within the descriptor
    pub vtable_base_offset: u32,

    /// Byte stride of one vtable entry
    pub vtable_entry_size: u32,
}

/// Computed open-world type-check payload
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OpenTypeCheckData {
    /// Ancestor class ids, root first, self last (bounded-depth prefix)
    pub ancestor_ids: Box<[u32]>,

    /// All implemented interfaces, in declaration order
    pub islots: Box<[InterfaceSlot]>,

    /// Perfect hash table over the hashed subset, or `None`
    ///
    /// Entries pack `(itable_offset << 16) | interface_id`, 16 bits each;
    /// 0 marks an empty slot, which is why interface id 0 is disallowed.
    pub hash_table: Option<Box<[u32]>>,

    /// Shift-and-mask parameter: `shift << 24 | mask`
    pub hash_param: u32,

    /// Number of interfaces reachable through the hash table
    pub num_hashed: u32,
}

impl OpenTypeCheckData {
    /// Depth of the type in the class hierarchy (root = 0)
    #[inline]
    pub fn depth(&self) -> usize {
        self.ancestor_ids.len() - 1
    }

    /// Number of interfaces a linear walk iterates
    #[inline]
    pub fn num_iterable_interfaces(&self) -> usize {
        self.islots.len()
    }

    /// Look up the itable offset for `interface_id`
    ///
    /// One hash probe when the table covers the id, otherwise a scan of
    /// the linear slots. `None` means the interface is not implemented.
    #[inline]
    pub fn itable_offset(&self, interface_id: u32) -> Option<u32> {
        if let Some(table) = &self.hash_table {
            let entry = table[hash(interface_id, self.hash_param) as usize];
            if entry & 0xFFFF == interface_id {
                return Some(entry >> 16);
            }
        }
        self.islots
            .iter()
            .find(|slot| slot.interface_id == interface_id)
            .map(|slot| slot.itable_offset)
    }

    /// Whether the type implements `interface_id`
    #[inline]
    pub fn implements(&self, interface_id: u32) -> bool {
        self.itable_offset(interface_id).is_some()
    }
}

/// The shift-and-mask hash: `(v >> shift) & mask`
#[inline]
pub fn hash(value: u32, param: u32) -> u32 {
    (value >> (param >> PARAM_MASK_BITS)) & (param & PARAM_MASK)
}

/// Compute a hash parameter that is injective over `keys`
///
/// Keys must be distinct and nonzero. Returns `None` when no parameter
/// fits the bit budget; callers then route every interface to the linear
/// table. The search is greedy, not provably minimal: starting from the
/// mask of bits that differ across at least one key pair (`OR ^ AND`),
/// it tries clearing each bit from the top down, keeping a clear only if
/// the hash stays injective, then folds trailing zero bits into the shift.
pub fn hash_param(keys: &[u32]) -> Option<u32> {
    debug_assert!(keys.iter().all(|&k| k != 0));
    if keys.len() <= 1 {
        return Some(0);
    }

    let or = keys.iter().fold(0u32, |acc, &k| acc | k);
    let and = keys.iter().fold(u32::MAX, |acc, &k| acc & k);
    // Discriminative bits: set where at least one key pair differs. Any
    // two distinct keys differ in such a bit, so this mask is injective.
    let mut mask = or ^ and;
    debug_assert!(mask != 0, "hash keys must be distinct");

    let mut scratch = FxHashSet::default();
    for bit in (0..32).rev() {
        let candidate = mask & !(1u32 << bit);
        if candidate == mask {
            continue;
        }
        if is_injective(keys, candidate, &mut scratch) {
            mask = candidate;
        }
    }

    let shift = mask.trailing_zeros();
    let mask = mask >> shift;
    if mask > PARAM_MASK {
        return None;
    }
    Some(shift << PARAM_MASK_BITS | mask)
}

fn is_injective(keys: &[u32], mask: u32, scratch: &mut FxHashSet<u32>) -> bool {
    scratch.clear();
    keys.iter().all(|&k| scratch.insert(k & mask))
}

/// Encode the complete open-world type-check payload for one type
pub fn encode_type_checks(
    input: &TypeCheckInput,
    config: HashingConfig,
) -> Result<OpenTypeCheckData, MetaError> {
    if input.interface_ids.len() != input.itable_starts.len() {
        return Err(MetaError::InterfaceInputMismatch {
            ids: input.interface_ids.len(),
            offsets: input.itable_starts.len(),
        });
    }

    let mut islots = Vec::with_capacity(input.interface_ids.len());
    let mut hashed: Vec<(u32, u32)> = Vec::new();
    for (&interface_id, &start) in input.interface_ids.iter().zip(input.itable_starts) {
        if interface_id == 0 {
            return Err(MetaError::ZeroInterfaceId);
        }
        let itable_offset = if input.implements_methods {
            let offset = input.vtable_base_offset as u64
                + start as u64 * input.vtable_entry_size as u64;
            u32::try_from(offset).map_err(|_| MetaError::ItableOffsetOverflow {
                offset,
                interface_id,
            })?
        } else {
            0
        };
        islots.push(InterfaceSlot {
            interface_id,
            itable_offset,
        });
        // A packed entry holds 16 bits of id and 16 bits of offset; anything
        // wider goes to the linear list even when the ceiling would admit it.
        if config.enabled
            && interface_id <= config.id_ceiling
            && interface_id <= HASHED_ID_MAX
            && itable_offset <= HASHED_OFFSET_MAX
        {
            hashed.push((interface_id, itable_offset));
        }
    }

    let (hash_table, hash_param, num_hashed) = build_hash_table(&hashed);
    Ok(OpenTypeCheckData {
        ancestor_ids: input.ancestor_ids.into(),
        islots: islots.into_boxed_slice(),
        hash_table,
        hash_param,
        num_hashed,
    })
}

/// Build the packed table, or fall back to linear-only when no parameter
/// fits the bit budget
fn build_hash_table(hashed: &[(u32, u32)]) -> (Option<Box<[u32]>>, u32, u32) {
    if hashed.is_empty() {
        return (None, 0, 0);
    }
    let keys: Vec<u32> = hashed.iter().map(|&(id, _)| id).collect();
    let param = match hash_param(&keys) {
        Some(param) => param,
        None => return (None, 0, 0),
    };
    let mask = param & PARAM_MASK;
    let mut table = vec![0u32; mask as usize + 1];
    for &(interface_id, itable_offset) in hashed {
        let slot = &mut table[hash(interface_id, param) as usize];
        debug_assert_eq!(*slot, 0, "hash parameter is not injective");
        *slot = itable_offset << 16 | interface_id;
    }
    (Some(table.into_boxed_slice()), param, hashed.len() as u32)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    fn assert_injective(keys: &[u32]) {
        let param = hash_param(keys).expect("no parameter found");
        let mut seen = FxHashSet::default();
        for &key in keys {
            assert!(
                seen.insert(hash(key, param)),
                "collision for {:#x} under param {:#x} over {:?}",
                key,
                param,
                keys
            );
        }
        let mask = param & PARAM_MASK;
        assert!(keys.iter().all(|&k| hash(k, param) <= mask));
    }

    #[test]
    fn test_degenerate_key_sets() {
        assert_eq!(hash_param(&[]), Some(0));
        assert_eq!(hash_param(&[42]), Some(0));
        assert_eq!(hash(42, 0), 0);
    }

    #[test]
    fn test_small_key_sets() {
        assert_injective(&[5, 9]);
        assert_injective(&[1, 2, 3, 4, 5, 6, 7]);
        assert_injective(&[100, 200, 300, 400]);
    }

    #[test]
    fn test_keys_differing_only_in_top_bit() {
        // OR ^ AND isolates bit 31; the trailing-zero fold must bring the
        // mask back under the 24-bit budget.
        assert_injective(&[0x8000_0001, 0x0000_0001]);
        let param = hash_param(&[0x8000_0001, 0x0000_0001]).unwrap();
        assert_eq!(param >> PARAM_MASK_BITS, 31);
        assert_eq!(param & PARAM_MASK, 1);
    }

    #[test]
    fn test_adversarial_high_bit_spread() {
        assert_injective(&[0x8000_0000, 0x4000_0000, 0xC000_0000, 0x2000_0000]);
        assert_injective(&[1, 0x8000_0001, 0x4000_0001, 0xC000_0001]);
    }

    #[test]
    fn test_randomized_key_sets() {
        let mut rng = StdRng::seed_from_u64(0x0417);
        for round in 0..200 {
            let len = 2 + (round % 60);
            let mut keys = FxHashSet::default();
            while keys.len() < len {
                let key: u32 = rng.gen();
                if key != 0 {
                    keys.insert(key);
                }
            }
            let keys: Vec<u32> = keys.into_iter().collect();
            assert_injective(&keys);
        }
    }

    #[test]
    fn test_randomized_small_id_sets() {
        // Interface ids in practice are small; the table should come out
        // reasonably dense.
        let mut rng = StdRng::seed_from_u64(7);
        for _ in 0..100 {
            let len = 2 + rng.gen_range(0..20);
            let mut keys = FxHashSet::default();
            while keys.len() < len {
                keys.insert(rng.gen_range(1u32..1024));
            }
            let keys: Vec<u32> = keys.into_iter().collect();
            assert_injective(&keys);
            let param = hash_param(&keys).unwrap();
            let capacity = (param & PARAM_MASK) as usize + 1;
            assert!(capacity >= keys.len());
        }
    }

    fn input<'a>(ids: &'a [u32], starts: &'a [u32], ancestors: &'a [u32]) -> TypeCheckInput<'a> {
        TypeCheckInput {
            implements_methods: true,
            ancestor_ids: ancestors,
            interface_ids: ids,
            itable_starts: starts,
            vtable_base_offset: 64,
            vtable_entry_size: 8,
        }
    }

    #[test]
    fn test_encode_routes_by_ceiling() {
        let data = encode_type_checks(
            &input(&[5, 9, 1_000_000], &[0, 2, 4], &[1, 7]),
            HashingConfig::default(),
        )
        .unwrap();

        assert_eq!(data.num_hashed, 2);
        assert_eq!(data.num_iterable_interfaces(), 3);
        let table = data.hash_table.as_ref().unwrap();
        assert!(table.iter().any(|&e| e & 0xFFFF == 5));
        assert!(table.iter().any(|&e| e & 0xFFFF == 9));
        // Only the two under-ceiling interfaces are in the table.
        assert_eq!(table.iter().filter(|&&e| e != 0).count(), 2);
        assert_ne!(hash(5, data.hash_param), hash(9, data.hash_param));

        // All three resolve, through either path.
        assert_eq!(data.itable_offset(5), Some(64));
        assert_eq!(data.itable_offset(9), Some(64 + 2 * 8));
        assert_eq!(data.itable_offset(1_000_000), Some(64 + 4 * 8));
        assert!(!data.implements(6));
    }

    #[test]
    fn test_encode_without_methods_has_zero_offsets() {
        let mut raw = input(&[5, 9], &[0, 2], &[1]);
        raw.implements_methods = false;
        let data = encode_type_checks(&raw, HashingConfig::default()).unwrap();
        assert_eq!(data.itable_offset(5), Some(0));
        assert_eq!(data.itable_offset(9), Some(0));
    }

    #[test]
    fn test_encode_disabled_hashing() {
        let config = HashingConfig {
            enabled: false,
            id_ceiling: 1023,
        };
        let data = encode_type_checks(&input(&[5, 9], &[0, 1], &[1]), config).unwrap();
        assert!(data.hash_table.is_none());
        assert_eq!(data.num_hashed, 0);
        assert_eq!(data.itable_offset(9), Some(72));
    }

    #[test]
    fn test_encode_rejects_zero_interface_id() {
        let err = encode_type_checks(&input(&[0], &[0], &[1]), HashingConfig::default());
        assert!(matches!(err, Err(MetaError::ZeroInterfaceId)));
    }

    #[test]
    fn test_encode_rejects_mismatched_input() {
        let err = encode_type_checks(&input(&[5, 9], &[0], &[1]), HashingConfig::default());
        assert!(matches!(err, Err(MetaError::InterfaceInputMismatch { .. })));
    }

    #[test]
    fn test_unencodable_itable_offset_is_fatal() {
        let raw = TypeCheckInput {
            implements_methods: true,
            ancestor_ids: &[1],
            interface_ids: &[5],
            itable_starts: &[u32::MAX],
            vtable_base_offset: 64,
            vtable_entry_size: 1024,
        };
        let err = encode_type_checks(&raw, HashingConfig::default());
        assert!(matches!(err, Err(MetaError::ItableOffsetOverflow { .. })));
    }

    #[test]
    fn test_wide_interface_id_falls_back_to_linear() {
        // Id 70_000 fits a generous ceiling but not the 16-bit id field of
        // a packed entry. Hashing it would alias every id with the same low
        // 16 bits (70_000 & 0xFFFF == 4_464) and corrupt the offset.
        let config = HashingConfig {
            enabled: true,
            id_ceiling: 1_000_000,
        };
        let data = encode_type_checks(&input(&[70_000], &[0], &[1]), config).unwrap();
        assert_eq!(data.num_hashed, 0);
        assert!(data.hash_table.is_none());
        assert_eq!(data.hash_param, 0);
        assert_eq!(data.itable_offset(70_000), Some(64));
        assert!(!data.implements(4_464));
        assert_eq!(data.itable_offset(4_464), None);
    }

    #[test]
    fn test_mixed_narrow_and_wide_interface_ids() {
        let config = HashingConfig {
            enabled: true,
            id_ceiling: 1_000_000,
        };
        let data = encode_type_checks(&input(&[5, 70_000], &[0, 2], &[1]), config).unwrap();
        assert_eq!(data.num_hashed, 1);
        assert_eq!(data.itable_offset(5), Some(64));
        assert_eq!(data.itable_offset(70_000), Some(64 + 2 * 8));
        assert!(!data.implements(4_464));
    }

    #[test]
    fn test_hash_param_exceeding_mask_budget() {
        // One-hot keys across bits 0..26: clearing the top bit survives the
        // injectivity check (only that key maps to 0), every later clear
        // collides with it, and nothing folds into the shift. The surviving
        // mask spans 25 bits, over the 24-bit budget.
        let keys: Vec<u32> = (0..26).map(|bit| 1u32 << bit).collect();
        assert_eq!(hash_param(&keys), None);
    }

    #[test]
    fn test_wide_itable_offset_falls_back_to_linear() {
        // Offset fits u32 but not the 16-bit hashed budget.
        let raw = TypeCheckInput {
            implements_methods: true,
            ancestor_ids: &[1],
            interface_ids: &[5, 9],
            itable_starts: &[0, 100_000],
            vtable_base_offset: 0,
            vtable_entry_size: 8,
        };
        let data = encode_type_checks(&raw, HashingConfig::default()).unwrap();
        assert_eq!(data.num_hashed, 1);
        assert_eq!(data.itable_offset(9), Some(800_000));
        assert_eq!(data.itable_offset(5), Some(0));
    }

    #[test]
    fn test_packed_entry_format() {
        let data = encode_type_checks(&input(&[5], &[3], &[1]), HashingConfig::default()).unwrap();
        let table = data.hash_table.as_ref().unwrap();
        assert_eq!(table.len(), 1);
        assert_eq!(table[0], (64 + 3 * 8) << 16 | 5);
    }
}
