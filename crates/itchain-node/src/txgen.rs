use std::time::{SystemTime, UNIX_EPOCH};

use itchain_core::{CoreError, PeerId, Transaction, TxData};
use rand::seq::SliceRandom;
use rand::Rng;

const ICODES: &[&str] = &["asset", "registry", "ledger"];
const FUNCTIONS: &[&str] = &["put", "transfer", "mint", "burn"];

/// Random invocation published by `publisher`
pub fn random_transaction<R: Rng>(rng: &mut R, publisher: PeerId) -> Result<Transaction, CoreError> {
    let icode = ICODES.choose(rng).copied().unwrap_or("asset");
    let function = FUNCTIONS.choose(rng).copied().unwrap_or("put");
    let arg_count = rng.gen_range(1..=3);

    let data = TxData {
        jsonrpc: "2.0".to_string(),
        icode_id: icode.to_string(),
        function: function.to_string(),
        args: (0..arg_count)
            .map(|_| rng.gen_range(0..1_000u32).to_string())
            .collect(),
        signature: Vec::new(),
    };

    Transaction::create(publisher, data, now_ms())
}

/// `count` transactions from randomly chosen publishers
pub fn random_batch<R: Rng>(
    rng: &mut R,
    publishers: &[PeerId],
    count: usize,
) -> Result<Vec<(PeerId, Transaction)>, CoreError> {
    let mut batch = Vec::with_capacity(count);
    for _ in 0..count {
        let Some(publisher) = publishers.choose(rng) else {
            break;
        };
        batch.push((publisher.clone(), random_transaction(rng, publisher.clone())?));
    }
    Ok(batch)
}

pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_random_batch() {
        let mut rng = rand::thread_rng();
        let publishers = vec![PeerId::new("peer-0"), PeerId::new("peer-1")];

        let batch = random_batch(&mut rng, &publishers, 10).unwrap();
        assert_eq!(batch.len(), 10);
        for (publisher, tx) in &batch {
            assert!(publishers.contains(publisher));
            assert_eq!(&tx.peer_id, publisher);
            assert!(!tx.args.is_empty());
        }
    }

    #[test]
    fn test_empty_publishers() {
        let mut rng = rand::thread_rng();
        assert!(random_batch(&mut rng, &[], 5).unwrap().is_empty());
    }
}
