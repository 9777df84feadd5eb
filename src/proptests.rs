use super::*;

use proptest::prelude::*;
use proptest_derive::Arbitrary;
use std::collections::BTreeMap;

fn name_strategy() -> impl Strategy<Value = Vec<u8>> {
    // A tiny alphabet keeps duplicates and shared prefixes frequent.
    prop::collection::vec(0u8..4, 0..=5)
}

#[derive(Clone, Debug, Arbitrary)]
enum Op {
    #[proptest(weight = 5)]
    Enroll(#[proptest(strategy = "name_strategy()")] Vec<u8>, u32),
    #[proptest(weight = 2)]
    RemoveName(#[proptest(strategy = "name_strategy()")] Vec<u8>),
    #[proptest(weight = 1)]
    RemoveCookie(#[proptest(strategy = "0u64..96")] u64),
    #[proptest(weight = 2)]
    Seek(#[proptest(strategy = "name_strategy()")] Vec<u8>),
}

type Model = BTreeMap<Vec<u8>, (Cookie, u32)>;

fn assert_matches_model(t: &NameTree<u32>, m: &Model) -> Result<(), TestCaseError> {
    prop_assert_eq!(t.check(), m.len());
    let got: Vec<(Vec<u8>, Cookie, u32)> = t
        .iter()
        .map(|e| (e.name().to_vec(), e.cookie(), *e.value()))
        .collect();
    let expected: Vec<(Vec<u8>, Cookie, u32)> =
        m.iter().map(|(k, &(c, v))| (k.clone(), c, v)).collect();
    prop_assert_eq!(&got, &expected);

    let backward: Vec<Cookie> = t.iter().rev().map(|e| e.cookie()).collect();
    let expected_backward: Vec<Cookie> = m.values().rev().map(|&(c, _)| c).collect();
    prop_assert_eq!(backward, expected_backward);

    for &(c, v) in m.values() {
        prop_assert_eq!(t.get(c).map(|e| *e.value()), Some(v));
    }
    Ok(())
}

proptest! {
    #![proptest_config(ProptestConfig {
        cases: 256,
        max_shrink_iters: 50_000,
        .. ProptestConfig::default()
    })]

    #[test]
    fn prop_equivalence(ops in prop::collection::vec(any::<Op>(), 0..=600), seed in any::<u64>()) {
        let mut t: NameTree<u32> = NameTree::with_config(
            NameTreeConfig::default().with_initial_capacity(4).with_seed(seed),
        );
        let mut m: Model = BTreeMap::new();

        for op in ops {
            match op {
                Op::Enroll(name, value) => {
                    let before = t.last_cookie;
                    match t.enroll(Entry::new(&name, value)) {
                        Ok(c) => {
                            prop_assert!(!m.contains_key(&name));
                            prop_assert!(c.get() > before);
                            m.insert(name, (c, value));
                        }
                        Err(e) => {
                            prop_assert_eq!(e.kind(), ErrorKind::DuplicateKey);
                            prop_assert!(m.contains_key(&name));
                            prop_assert_eq!(t.last_cookie, before);
                            prop_assert_eq!(e.into_entry().into_parts().1, value);
                        }
                    }
                }
                Op::RemoveName(name) => {
                    let cookie = t.lookup(&name).map(|e| e.cookie());
                    prop_assert_eq!(cookie, m.get(&name).map(|&(c, _)| c));
                    if let Some(c) = cookie {
                        let entry = t.remove(c).unwrap();
                        prop_assert_eq!(entry.name(), &name[..]);
                        m.remove(&name);
                        prop_assert!(t.remove(c).is_none());
                    }
                }
                Op::RemoveCookie(raw) => {
                    let c = Cookie(raw);
                    let owner = m.iter().find(|(_, v)| v.0 == c).map(|(k, _)| k.clone());
                    let removed = t.remove(c).map(|e| e.name().to_vec());
                    prop_assert_eq!(&removed, &owner);
                    if let Some(name) = owner {
                        m.remove(&name);
                    }
                }
                Op::Seek(name) => {
                    let got = t.seek(&name).map(|e| e.name().to_vec());
                    let expected = m.range(name.clone()..).next().map(|(k, _)| k.clone());
                    prop_assert_eq!(got, expected);

                    let got = t.floor(&name).map(|e| e.name().to_vec());
                    let expected = m.range(..=name.clone()).next_back().map(|(k, _)| k.clone());
                    prop_assert_eq!(got, expected);

                    let got: Vec<Vec<u8>> = t.prefix(&name).map(|e| e.name().to_vec()).collect();
                    let expected: Vec<Vec<u8>> =
                        m.keys().filter(|k| k.starts_with(&name)).cloned().collect();
                    prop_assert_eq!(got, expected);
                }
            }
            prop_assert_eq!(t.len(), m.len());
        }

        assert_matches_model(&t, &m)?;
    }

    #[test]
    fn prop_enroll_remove_restores_chain(
        names in prop::collection::btree_set(name_strategy(), 0..40),
        probe in name_strategy(),
        seed in any::<u64>(),
    ) {
        let mut t: NameTree<u32> = NameTree::with_config(NameTreeConfig::default().with_seed(seed));
        for name in &names {
            t.enroll(Entry::new(name, 0)).unwrap();
        }
        let chain: Vec<Cookie> = t.iter().map(|e| e.cookie()).collect();
        let tail = t.tail;
        let heads = t.heads.clone();

        match t.enroll(Entry::new(&probe, 1)) {
            Ok(c) => {
                prop_assert!(!names.contains(&probe));
                t.remove(c).unwrap();
            }
            Err(e) => prop_assert_eq!(e.kind(), ErrorKind::DuplicateKey),
        }

        let after: Vec<Cookie> = t.iter().map(|e| e.cookie()).collect();
        prop_assert_eq!(after, chain);
        prop_assert_eq!(t.tail, tail);
        prop_assert_eq!(&t.heads[..heads.len()], &heads[..]);
        prop_assert!(t.heads[heads.len()..].iter().all(|c| c.is_none()));
        t.check();
    }
}

/// Calls `f` with every ordering of `items`, generated in place by Heap's
/// algorithm.
fn for_each_ordering<T: Clone>(items: &[T], mut f: impl FnMut(&[T])) {
    let mut order = items.to_vec();
    let mut counters = vec![0usize; order.len()];
    f(order.as_slice());
    let mut i = 1;
    while i < order.len() {
        if counters[i] < i {
            let j = if i % 2 == 0 { 0 } else { counters[i] };
            order.swap(j, i);
            f(order.as_slice());
            counters[i] += 1;
            i = 1;
        } else {
            counters[i] = 0;
            i += 1;
        }
    }
}

fn small_set() -> Vec<Vec<u8>> {
    vec![
        b"a".to_vec(),
        b"b".to_vec(),
        b"c".to_vec(),
        b"aa".to_vec(),
        b"ab".to_vec(),
        b"ba".to_vec(),
    ]
}

#[test]
fn exhaustive_enroll_order_small_set() {
    let keys = small_set();
    let mut sorted = keys.clone();
    sorted.sort();

    let mut seed = 0;
    for_each_ordering(&keys, |order| {
        seed += 1;
        let mut t: NameTree<u64> = NameTree::with_config(NameTreeConfig::default().with_seed(seed));
        for (i, k) in order.iter().enumerate() {
            t.enroll(Entry::new(k, i as u64)).unwrap();
        }

        assert_eq!(t.check(), sorted.len());
        let got: Vec<Vec<u8>> = t.iter().map(|e| e.name().to_vec()).collect();
        assert_eq!(got, sorted);
    });
    assert_eq!(seed, 720);
}

#[test]
fn exhaustive_remove_order_small_set() {
    let keys = small_set();

    // Enroll in a fixed order, then remove in every order.
    let mut base: NameTree<u64> = NameTree::with_config(NameTreeConfig::default().with_seed(7));
    let mut base_model: BTreeMap<Vec<u8>, Cookie> = BTreeMap::new();
    for (i, k) in keys.iter().enumerate() {
        let c = base.enroll(Entry::new(k, i as u64)).unwrap();
        base_model.insert(k.clone(), c);
    }

    for_each_ordering(&keys, |order| {
        let mut t = base.clone();
        let mut m = base_model.clone();

        for k in order {
            let c = m.remove(k).unwrap();
            let entry = t.remove(c).unwrap();
            assert_eq!(entry.name(), &k[..]);
            assert_eq!(t.len(), m.len());
            assert_eq!(t.check(), m.len());
            let last = t.last().map(|e| e.name().to_vec());
            assert_eq!(last, m.keys().next_back().cloned());
        }
        assert!(t.is_empty());
        assert!(t.tail.is_none());
        assert!(t.heads.iter().all(|c| c.is_none()));
    });
}
