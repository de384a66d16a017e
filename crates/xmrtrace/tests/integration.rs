//! Integration tests: saved daemon fixtures plus end-to-end runs over in-memory ledgers.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::Path;
use xmrtrace::chain::{
    decode_offsets, inputs_from_tx_json, tx_hashes_from_block_json, BlockResult, OutsResponse,
    RingInput, TransactionsResponse,
};
use xmrtrace::ring::{ingest_heights, IngestError, IngestOptions};
use xmrtrace::verify::verify_bundle_hash;
use xmrtrace::{
    merge_siblings, reproducibility_hash, run_fork_pair, Address, ChainId, ChainsConfig, ForkPair,
    IndexResolver, KeyImage, Ledger, LookupError, OutputLookup, ResidualBundle, RingStore,
    StoredOutputs,
};

fn load_fixture<T: serde::de::DeserializeOwned>(path: &str) -> T {
    let root = Path::new(env!("CARGO_MANIFEST_DIR")).join("../../testdata");
    let full = root.join(path);
    let s =
        std::fs::read_to_string(&full).unwrap_or_else(|e| panic!("read {}: {}", full.display(), e));
    serde_json::from_str(&s).unwrap_or_else(|e| panic!("parse {}: {}", path, e))
}

#[test]
fn integration_fixture_block_parse() {
    let v: serde_json::Value = load_fixture("get_block_1685560.json");
    let block: BlockResult = serde_json::from_value(v["result"].clone()).unwrap();
    assert_eq!(block.status, "OK");
    assert_eq!(block.block_header.height, 1685560);
    let hashes = tx_hashes_from_block_json(&block.json).unwrap();
    assert_eq!(hashes.len(), 2);
    assert!(hashes[0].starts_with("c1a9f4e2"));
}

#[test]
fn integration_fixture_transactions_decode() {
    let resp: TransactionsResponse = load_fixture("get_transactions.json");
    assert_eq!(resp.txs.len(), 2);
    assert!(resp.missed_tx.is_empty());

    let rct = inputs_from_tx_json(&resp.txs[0].as_json).unwrap();
    assert_eq!(rct.len(), 2);
    assert_eq!(rct[0].amount, 0);
    assert_eq!(
        rct[0].key_image,
        KeyImage::new("5a1f3c9e2b7d4068a1c3e5f7092b4d6f8a0c2e4f6a8b0d2e4f1a3c5e7092b4d6")
    );
    let ring = decode_offsets(&rct[0].key_offsets).unwrap();
    assert_eq!(ring.len(), 7);
    assert_eq!(ring[0], 5421873);
    assert_eq!(*ring.last().unwrap(), 5421873 + 402113 + 19811 + 4420 + 1107 + 388 + 92);
    assert!(ring.windows(2).all(|w| w[0] <= w[1]));

    let pre_rct = inputs_from_tx_json(&resp.txs[1].as_json).unwrap();
    assert_eq!(pre_rct[0].amount, 20_000_000_000);
    assert_eq!(decode_offsets(&pre_rct[0].key_offsets).unwrap(), vec![112, 116, 206]);
}

#[test]
fn integration_fixture_outs_parse() {
    let resp: OutsResponse = load_fixture("get_outs.json");
    assert_eq!(resp.status, "OK");
    assert_eq!(resp.outs.len(), 2);
    assert_eq!(
        Address::new(&resp.outs[0].key),
        Address::new("9e4a1c7f3b2d8e6a0c5f9b3d7e1a4c8f2b6d0e9a3c7f1b5d9e2a6c0f4b8d3e7a")
    );
}

#[test]
fn integration_fixture_config() {
    let s = std::fs::read_to_string(
        Path::new(env!("CARGO_MANIFEST_DIR")).join("../../testdata/xmrtrace.json"),
    )
    .unwrap();
    let cfg = ChainsConfig::from_json(&s).unwrap();
    assert_eq!(cfg.chains.len(), 3);
    let xmo = cfg.fetch_for(&ChainId::new("xmo"), false);
    assert_eq!(xmo.rate_limit_ms, 100);
    assert_eq!(xmo.max_retries, 5);
}

/// One chain held in memory: blocks of transactions of ring inputs, and its output set.
#[derive(Default)]
struct FakeChain {
    blocks: BTreeMap<u64, Vec<String>>,
    txs: HashMap<String, Vec<RingInput>>,
    outputs: HashMap<(u64, u64), Address>,
}

const PRE_FORK_OUTPUTS: u64 = 50;
const TOTAL_OUTPUTS: u64 = 100;

impl FakeChain {
    /// Outputs below `PRE_FORK_OUTPUTS` are shared history; the rest are chain-specific.
    fn new(name: &str) -> Self {
        let outputs = (0..TOTAL_OUTPUTS)
            .map(|i| {
                let addr = if i < PRE_FORK_OUTPUTS {
                    format!("pre{i:03}")
                } else {
                    format!("{name}{i:03}")
                };
                ((0, i), Address::new(addr))
            })
            .collect();
        Self {
            outputs,
            ..Default::default()
        }
    }

    fn tx(&mut self, height: u64, hash: &str, inputs: Vec<(&str, Vec<u64>)>) {
        self.blocks.entry(height).or_default().push(hash.to_string());
        let inputs = inputs
            .into_iter()
            .map(|(image, ring)| RingInput {
                amount: 0,
                key_image: KeyImage::new(image),
                key_offsets: relative(&ring),
            })
            .collect();
        self.txs.insert(hash.to_string(), inputs);
    }
}

impl OutputLookup for FakeChain {
    fn output(&self, amount: u64, index: u64) -> Result<Option<Address>, LookupError> {
        Ok(self.outputs.get(&(amount, index)).cloned())
    }
}

impl Ledger for FakeChain {
    fn block_tx_hashes(&self, height: u64) -> Result<Vec<String>, LookupError> {
        Ok(self.blocks.get(&height).cloned().unwrap_or_default())
    }

    fn ring_inputs(&self, tx_hashes: &[String]) -> Result<Vec<RingInput>, LookupError> {
        Ok(tx_hashes
            .iter()
            .filter_map(|h| self.txs.get(h))
            .flatten()
            .cloned()
            .collect())
    }
}

/// Absolute (ascending) ring to the relative offsets a transaction carries.
fn relative(ring: &[u64]) -> Vec<u64> {
    let mut prev = 0;
    ring.iter()
        .map(|i| {
            let off = i - prev;
            prev = *i;
            off
        })
        .collect()
}

fn xmr() -> ChainId {
    ChainId::new("xmr")
}
fn xmv() -> ChainId {
    ChainId::new("xmv")
}
fn xmo() -> ChainId {
    ChainId::new("xmo")
}

/// Three forks. Per key image the true spend is a pre-fork output present in every ring.
fn world() -> (FakeChain, FakeChain, FakeChain) {
    let mut a = FakeChain::new("xmr");
    a.tx(100, "t1", vec![("aa01", vec![7, 55, 60]), ("aa02", vec![3, 9, 70])]);
    a.tx(
        101,
        "t2",
        vec![
            ("aa03", vec![11, 12, 13]),
            ("aa04", vec![1, 2, 3]),
            ("aa05", vec![4, 4, 30]),
        ],
    );

    let mut b = FakeChain::new("xmv");
    b.tx(
        100,
        "v1",
        vec![
            ("aa01", vec![7, 52, 58]),
            ("aa02", vec![3, 9, 51]),
            ("aa03", vec![20, 21, 22]),
            ("aa05", vec![4, 30, 77]),
        ],
    );

    let mut c = FakeChain::new("xmo");
    c.tx(200, "o1", vec![("aa01", vec![7, 61, 99]), ("aa02", vec![9, 20, 66])]);
    (a, b, c)
}

fn ingest_all(store: &RingStore, a: &FakeChain, b: &FakeChain, c: &FakeChain) {
    let opts = |from, to| IngestOptions {
        from_height: Some(from),
        to_height: to,
        record_outputs: false,
    };
    ingest_heights(a, store, &xmr(), &opts(100, 101)).unwrap();
    ingest_heights(b, store, &xmv(), &opts(100, 100)).unwrap();
    ingest_heights(c, store, &xmo(), &opts(200, 200)).unwrap();
}

fn run(store: &RingStore, pair: &ForkPair, left: &FakeChain, right: &FakeChain) -> xmrtrace::RunReport {
    let mut ra = IndexResolver::new(pair.left.clone(), left);
    let mut rb = IndexResolver::new(pair.right.clone(), right);
    run_fork_pair(store, pair, &mut ra, &mut rb).unwrap()
}

fn fork_sets(store: &RingStore, chain: &ChainId) -> BTreeMap<KeyImage, Option<BTreeSet<u64>>> {
    store
        .scan(chain)
        .unwrap()
        .into_iter()
        .map(|r| (r.image, r.fork_indices))
        .collect()
}

fn fork(store: &RingStore, chain: &ChainId, image: &str) -> Option<BTreeSet<u64>> {
    store
        .get(chain, &KeyImage::new(image))
        .unwrap()
        .and_then(|r| r.fork_indices)
}

#[test]
fn integration_ingest_then_intersect() {
    let (a, b, c) = world();
    let store = RingStore::open_in_memory().unwrap();
    ingest_all(&store, &a, &b, &c);
    assert_eq!(store.count(&xmr()).unwrap(), 5);

    let report = run(&store, &ForkPair::new(xmr(), xmv()), &a, &b);
    assert_eq!(report.left_images, 5);
    assert_eq!(report.shared_images, 4);
    assert_eq!(report.processed, 4);
    assert_eq!(report.fully_deanonymized, 1);
    assert_eq!(report.anomalies, 1);
    assert!(report.failures.is_empty());

    assert_eq!(fork(&store, &xmr(), "aa01"), Some(BTreeSet::from([7])));
    assert_eq!(fork(&store, &xmr(), "aa02"), Some(BTreeSet::from([3, 9])));
    assert_eq!(fork(&store, &xmr(), "aa03"), Some(BTreeSet::new()));
    assert_eq!(fork(&store, &xmr(), "aa04"), None);
    assert_eq!(fork(&store, &xmr(), "aa05"), Some(BTreeSet::from([4, 30])));
    // right side is never written when the result goes to the left table
    assert!(fork_sets(&store, &xmv()).values().all(Option::is_none));

    let bundle = ResidualBundle::from_store(&store, &xmr()).unwrap();
    assert_eq!(bundle.stats.histogram, BTreeMap::from([(0, 1), (1, 1), (2, 2)]));
    assert_eq!(bundle.stats.not_narrowed, 1);
    assert_eq!(bundle.residuals.len(), 4);
}

#[test]
fn integration_rerun_is_idempotent() {
    let (a, b, c) = world();
    let store = RingStore::open_in_memory().unwrap();
    ingest_all(&store, &a, &b, &c);
    let pair = ForkPair::new(xmr(), xmv());

    let first = run(&store, &pair, &a, &b);
    let after_first = fork_sets(&store, &xmr());
    let hash_first = reproducibility_hash(&ResidualBundle::from_store(&store, &xmr()).unwrap()).unwrap();

    let second = run(&store, &pair, &a, &b);
    assert_eq!(fork_sets(&store, &xmr()), after_first);
    assert_eq!(second.processed, first.processed);
    assert_eq!(second.fully_deanonymized, first.fully_deanonymized);

    let bundle = ResidualBundle::from_store(&store, &xmr()).unwrap();
    let check = verify_bundle_hash(&bundle, Some(hash_first.as_str())).unwrap();
    assert!(check.matches);
}

#[test]
fn integration_third_fork_only_narrows() {
    let (a, b, c) = world();
    let store = RingStore::open_in_memory().unwrap();
    ingest_all(&store, &a, &b, &c);
    run(&store, &ForkPair::new(xmr(), xmv()), &a, &b);
    let before = fork_sets(&store, &xmr());

    let report = run(&store, &ForkPair::new(xmr(), xmo()), &a, &c);
    assert_eq!(report.shared_images, 2);
    let after = fork_sets(&store, &xmr());

    for (image, prior) in &before {
        let (Some(prior), Some(now)) = (prior, &after[image]) else {
            continue;
        };
        assert!(now.is_subset(prior), "{image} grew: {prior:?} -> {now:?}");
    }
    assert_eq!(fork(&store, &xmr(), "aa02"), Some(BTreeSet::from([9])));
    assert_eq!(fork(&store, &xmr(), "aa01"), Some(BTreeSet::from([7])));
    // untouched by the xmo pass
    assert_eq!(fork(&store, &xmr(), "aa05"), Some(BTreeSet::from([4, 30])));
}

#[test]
fn integration_pair_order_does_not_matter() {
    let (a, b, c) = world();

    let s1 = RingStore::open_in_memory().unwrap();
    ingest_all(&s1, &a, &b, &c);
    run(&s1, &ForkPair::new(xmr(), xmv()), &a, &b);
    run(&s1, &ForkPair::new(xmr(), xmo()), &a, &c);

    let s2 = RingStore::open_in_memory().unwrap();
    ingest_all(&s2, &a, &b, &c);
    run(&s2, &ForkPair::new(xmr(), xmo()), &a, &c);
    run(&s2, &ForkPair::new(xmr(), xmv()), &a, &b);

    assert_eq!(fork_sets(&s1, &xmr()), fork_sets(&s2, &xmr()));

    // narrow xmv against xmo first, then xmr against the already narrowed xmv
    let s3 = RingStore::open_in_memory().unwrap();
    ingest_all(&s3, &a, &b, &c);
    run(&s3, &ForkPair::new(xmv(), xmo()), &b, &c);
    assert_eq!(fork(&s3, &xmv(), "aa02"), Some(BTreeSet::from([9])));
    run(&s3, &ForkPair::new(xmr(), xmv()), &a, &b);
    assert_eq!(fork_sets(&s3, &xmr()), fork_sets(&s1, &xmr()));
}

#[test]
fn integration_true_spend_always_survives() {
    // deterministic LCG so the rings are varied but reproducible
    let mut state: u64 = 0x2545_f491_4f6c_dd1d;
    let mut next = move |bound: u64| {
        state = state
            .wrapping_mul(6364136223846793005)
            .wrapping_add(1442695040888963407);
        (state >> 33) % bound
    };

    let mut a = FakeChain::new("xmr");
    let mut b = FakeChain::new("xmv");
    let mut truth = BTreeMap::new();
    for n in 0..40u64 {
        let image = format!("{n:04x}");
        let spent = next(PRE_FORK_OUTPUTS);
        let ring = |next: &mut dyn FnMut(u64) -> u64| {
            let mut r: Vec<u64> = (0..10).map(|_| next(TOTAL_OUTPUTS)).collect();
            r.push(spent);
            r.sort_unstable();
            r
        };
        let ra = ring(&mut next);
        let rb = ring(&mut next);
        a.tx(1 + n, &format!("a{n}"), vec![(image.as_str(), ra)]);
        b.tx(1 + n, &format!("b{n}"), vec![(image.as_str(), rb)]);
        truth.insert(KeyImage::new(image), spent);
    }

    let store = RingStore::open_in_memory().unwrap();
    let opts = IngestOptions {
        from_height: Some(1),
        to_height: 40,
        record_outputs: false,
    };
    ingest_heights(&a, &store, &xmr(), &opts).unwrap();
    ingest_heights(&b, &store, &xmv(), &opts).unwrap();

    let report = run(&store, &ForkPair::new(xmr(), xmv()), &a, &b);
    assert_eq!(report.processed, 40);
    assert_eq!(report.anomalies, 0);
    for r in store.scan(&xmr()).unwrap() {
        let fork = r.fork_indices.unwrap();
        assert!(fork.contains(&truth[&r.image]), "{} lost its true spend", r.image);
        assert!(fork.is_subset(&r.distinct_ring_indices));
    }
}

#[test]
fn integration_ingest_resumes_from_cursor() {
    let (a, _, _) = world();
    let store = RingStore::open_in_memory().unwrap();

    let first = ingest_heights(
        &a,
        &store,
        &xmr(),
        &IngestOptions {
            from_height: Some(100),
            to_height: 100,
            record_outputs: false,
        },
    )
    .unwrap();
    assert_eq!(first.inserted, 2);
    assert_eq!(store.cursor(&xmr()).unwrap(), Some(101));

    let resumed = IngestOptions {
        from_height: None,
        to_height: 101,
        record_outputs: false,
    };
    let second = ingest_heights(&a, &store, &xmr(), &resumed).unwrap();
    assert_eq!(second.blocks, 1);
    assert_eq!(second.inserted, 3);
    assert_eq!(store.count(&xmr()).unwrap(), 5);

    // caught up: nothing left in range
    assert!(matches!(
        ingest_heights(&a, &store, &xmr(), &resumed),
        Err(IngestError::EmptyRange { from: 102, to: 101 })
    ));

    let again = ingest_heights(
        &a,
        &store,
        &xmr(),
        &IngestOptions {
            from_height: Some(100),
            to_height: 101,
            record_outputs: false,
        },
    )
    .unwrap();
    assert_eq!(again.inputs, 5);
    assert_eq!(again.inserted, 0);
}

#[test]
fn integration_ingest_skips_empty_offsets() {
    let mut a = FakeChain::new("xmr");
    a.tx(5, "t", vec![("bb01", vec![1, 2]), ("bb02", vec![])]);
    let store = RingStore::open_in_memory().unwrap();
    let summary = ingest_heights(
        &a,
        &store,
        &xmr(),
        &IngestOptions {
            from_height: Some(5),
            to_height: 5,
            record_outputs: false,
        },
    )
    .unwrap();
    assert_eq!(summary.inputs, 2);
    assert_eq!(summary.skipped_inputs, 1);
    assert_eq!(summary.inserted, 1);
}

#[test]
fn integration_offline_run_from_recorded_outputs() {
    let (a, b, c) = world();
    let store = RingStore::open_in_memory().unwrap();
    let opts = |from, to| IngestOptions {
        from_height: Some(from),
        to_height: to,
        record_outputs: true,
    };
    let sa = ingest_heights(&a, &store, &xmr(), &opts(100, 101)).unwrap();
    assert_eq!(sa.outputs_recorded, 13);
    assert_eq!(sa.unresolved_outputs, 0);
    ingest_heights(&b, &store, &xmv(), &opts(100, 100)).unwrap();
    ingest_heights(&c, &store, &xmo(), &opts(200, 200)).unwrap();

    let pair = ForkPair::new(xmr(), xmv());
    let mut ra = IndexResolver::new(xmr(), StoredOutputs::new(&store, xmr()));
    let mut rb = IndexResolver::new(xmv(), StoredOutputs::new(&store, xmv()));
    let offline = run_fork_pair(&store, &pair, &mut ra, &mut rb).unwrap();
    assert_eq!(offline.partial_warnings, 0);

    let online = RingStore::open_in_memory().unwrap();
    ingest_all(&online, &a, &b, &c);
    run(&online, &pair, &a, &b);
    assert_eq!(fork_sets(&store, &xmr()), fork_sets(&online, &xmr()));
}

#[test]
fn integration_sibling_tables_merge() {
    let (a, b, c) = world();
    let store = RingStore::open_in_memory().unwrap();
    ingest_all(&store, &a, &b, &c);
    let xmr_xmv = ChainId::new("xmr_xmv");
    let xmr_xmo = ChainId::new("xmr_xmo");
    run(&store, &ForkPair::new(xmr(), xmv()).into_table(xmr_xmv.clone()), &a, &b);
    run(&store, &ForkPair::new(xmr(), xmo()).into_table(xmr_xmo.clone()), &a, &c);
    // base table untouched when results go elsewhere
    assert!(fork_sets(&store, &xmr()).values().all(Option::is_none));
    assert_eq!(fork(&store, &xmr_xmv, "aa02"), Some(BTreeSet::from([3, 9])));
    assert_eq!(fork(&store, &xmr_xmo, "aa02"), Some(BTreeSet::from([9])));

    let report = merge_siblings(&store, &[xmr_xmv, xmr_xmo], &xmr()).unwrap();
    assert!(report.failures.is_empty());
    assert_eq!(fork(&store, &xmr(), "aa01"), Some(BTreeSet::from([7])));
    assert_eq!(fork(&store, &xmr(), "aa02"), Some(BTreeSet::from([9])));
    assert_eq!(fork(&store, &xmr(), "aa03"), Some(BTreeSet::new()));
    assert_eq!(fork(&store, &xmr(), "aa05"), Some(BTreeSet::from([4, 30])));
}

#[test]
fn integration_store_survives_reopen() {
    let (a, b, c) = world();
    let file = tempfile::NamedTempFile::new().unwrap();
    let path = file.path();
    {
        let store = RingStore::open(path).unwrap();
        ingest_all(&store, &a, &b, &c);
        run(&store, &ForkPair::new(xmr(), xmv()), &a, &b);
    }
    let store = RingStore::open(path).unwrap();
    assert_eq!(fork(&store, &xmr(), "aa01"), Some(BTreeSet::from([7])));
    assert_eq!(store.cursor(&xmv()).unwrap(), Some(101));
}
