use indexmap::IndexSet;
use parking_lot::RwLock;
use rand::Rng;
use std::sync::Arc;

/// Identity of one signature check: the signed digest (a transaction
/// sighash or a CHECKSIGFROMSTACK message), the signature bytes as they
/// appeared on the stack (including any trailing sighash-type byte), and
/// the public key.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct SigCacheKey {
    sig_hash: [u8; 32],
    signature: Vec<u8>,
    pub_key: Vec<u8>,
}

impl SigCacheKey {
    pub(crate) fn new(sig_hash: [u8; 32], signature: &[u8], pub_key: &[u8]) -> Self {
        Self { sig_hash, signature: signature.to_vec(), pub_key: pub_key.to_vec() }
    }
}

/// Shared memo of signature checks that already verified.
///
/// Transaction scripts are often executed more than once from different
/// contexts (mempool admission, template building, full validation), so
/// engines share one instance. Only successful checks are recorded, which
/// keeps a hit and a miss different in cost but never in outcome.
#[derive(Clone)]
pub struct SigCache {
    // An IndexSet rather than a HashSet, since it makes it cheap to evict
    // a random entry once the cache is full.
    validated: Arc<RwLock<IndexSet<SigCacheKey>>>,
    size: usize,
}

impl SigCache {
    pub fn new(size: u64) -> Self {
        Self { validated: Arc::new(RwLock::new(IndexSet::with_capacity(size as usize))), size: size as usize }
    }

    pub(crate) fn contains(&self, key: &SigCacheKey) -> bool {
        self.validated.read().contains(key)
    }

    pub(crate) fn add(&self, key: SigCacheKey) {
        if self.size == 0 {
            return;
        }
        let mut write_guard = self.validated.write();
        if write_guard.len() == self.size {
            let evicted = rand::thread_rng().gen_range(0..self.size);
            write_guard.swap_remove_index(evicted);
        }
        write_guard.insert(key);
    }
}
