use std::cmp::Ordering;
use std::collections::HashMap;

use crate::record::{Availability, CanonicalRecord, Payload};

/// Which record of a group survives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TieBreak {
    /// Lowest price; absent sorts after every present price.
    LowestPrice,
    FirstSeen,
}

impl TieBreak {
    fn compare(&self, a: &CanonicalRecord, b: &CanonicalRecord) -> Ordering {
        match self {
            TieBreak::LowestPrice => match (a.price(), b.price()) {
                (Some(x), Some(y)) => x.cmp(&y),
                (Some(_), None) => Ordering::Less,
                (None, Some(_)) => Ordering::Greater,
                (None, None) => Ordering::Equal,
            },
            TieBreak::FirstSeen => Ordering::Equal,
        }
    }
}

/// One record per natural key, ordered by the group's best rank and renumbered
/// from 1.
pub fn deduplicate(records: Vec<CanonicalRecord>, tie: TieBreak) -> Vec<CanonicalRecord> {
    let mut order: Vec<String> = Vec::new();
    let mut groups: HashMap<String, Vec<CanonicalRecord>> = HashMap::new();
    for r in records {
        groups
            .entry(r.key.clone())
            .or_insert_with(|| {
                order.push(r.key.clone());
                Vec::new()
            })
            .push(r);
    }

    let mut out: Vec<CanonicalRecord> = order
        .into_iter()
        .filter_map(|key| groups.remove(&key))
        .filter_map(|group| collapse(group, tie))
        .collect();

    out.sort_by_key(|r| r.rank);
    for (i, r) in out.iter_mut().enumerate() {
        r.rank = i + 1;
    }
    out
}

fn collapse(group: Vec<CanonicalRecord>, tie: TieBreak) -> Option<CanonicalRecord> {
    // min_by keeps the first of equal minima
    let best = group.iter().min_by(|a, b| tie.compare(a, b))?;
    let mut rep = best.clone();
    rep.rank = group.iter().map(|r| r.rank).min().unwrap_or(rep.rank);
    merge_fields(&mut rep.payload, &group);
    Some(rep)
}

fn first_some<T: Clone>(
    group: &[CanonicalRecord],
    field: impl Fn(&Payload) -> Option<&T>,
) -> Option<T> {
    group.iter().find_map(|r| field(&r.payload)).cloned()
}

/// First non-empty value across the group, field by field. The tie-broken
/// field (price) stays the representative's.
fn merge_fields(payload: &mut Payload, group: &[CanonicalRecord]) {
    match payload {
        Payload::Product(p) => {
            let products = move || {
                group.iter().filter_map(|r| match &r.payload {
                    Payload::Product(x) => Some(x),
                    Payload::Message(_) => None,
                })
            };
            p.title = products().find_map(|x| x.title.clone());
            p.url = products().find_map(|x| x.url.clone());
            p.image_url = products().find_map(|x| x.image_url.clone());
            p.keyword = products().find_map(|x| x.keyword.clone());
            if p.availability == Availability::Unknown {
                p.availability = products()
                    .map(|x| x.availability)
                    .find(|a| *a != Availability::Unknown)
                    .unwrap_or(Availability::Unknown);
            }
        }
        Payload::Message(m) => {
            m.text = first_some(group, |pl| match pl {
                Payload::Message(x) => x.text.as_ref(),
                Payload::Product(_) => None,
            });
            m.permalink = first_some(group, |pl| match pl {
                Payload::Message(x) => x.permalink.as_ref(),
                Payload::Product(_) => None,
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use chrono::{FixedOffset, TimeZone};

    use super::*;
    use crate::record::{Cursor, Message, Product};

    fn product(key: &str, rank: usize, price: Option<u64>, title: Option<&str>) -> CanonicalRecord {
        CanonicalRecord {
            key: key.to_string(),
            rank,
            position: Cursor::ZERO,
            captured_at: FixedOffset::east_opt(9 * 3600)
                .unwrap()
                .with_ymd_and_hms(2025, 1, 15, 9, 0, 0)
                .unwrap(),
            source: "amazon_search".into(),
            payload: Payload::Product(Product {
                keyword: Some("mouse".into()),
                title: title.map(str::to_string),
                price,
                currency: "JPY".into(),
                availability: Availability::Unknown,
                url: None,
                image_url: None,
            }),
        }
    }

    fn title(r: &CanonicalRecord) -> Option<&str> {
        match &r.payload {
            Payload::Product(p) => p.title.as_deref(),
            Payload::Message(_) => None,
        }
    }

    #[test]
    fn priced_record_beats_absent() {
        let out = deduplicate(
            vec![product("B001", 1, None, None), product("B001", 2, Some(1980), None)],
            TieBreak::LowestPrice,
        );
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].price(), Some(1980));
        assert_eq!(out[0].rank, 1);
    }

    #[test]
    fn one_representative_with_minimum_price() {
        let input = vec![
            product("A", 1, Some(500), None),
            product("B", 2, Some(900), None),
            product("A", 3, Some(300), None),
            product("C", 4, None, None),
            product("B", 5, Some(700), None),
            product("A", 6, None, None),
        ];
        let out = deduplicate(input.clone(), TieBreak::LowestPrice);
        assert_eq!(out.len(), 3);
        for r in &out {
            let group: Vec<_> = input.iter().filter(|x| x.key == r.key).collect();
            let min = group.iter().filter_map(|x| x.price()).min();
            assert_eq!(r.price(), min);
            assert_eq!(out.iter().filter(|x| x.key == r.key).count(), 1);
        }
    }

    #[test]
    fn ranks_follow_best_rank_and_are_contiguous() {
        let out = deduplicate(
            vec![
                product("X", 2, Some(100), None),
                product("Y", 3, Some(100), None),
                product("X", 5, Some(50), None),
                product("Z", 9, None, None),
            ],
            TieBreak::LowestPrice,
        );
        let keys: Vec<&str> = out.iter().map(|r| r.key.as_str()).collect();
        let ranks: Vec<usize> = out.iter().map(|r| r.rank).collect();
        assert_eq!(keys, vec!["X", "Y", "Z"]);
        assert_eq!(ranks, vec![1, 2, 3]);
        assert_eq!(out[0].price(), Some(50));
    }

    #[test]
    fn first_non_empty_title_wins() {
        let out = deduplicate(
            vec![
                product("B001", 1, Some(2480), Some("Mouse (Sponsored)")),
                product("B001", 2, Some(1980), None),
                product("B001", 3, Some(1980), Some("Mouse")),
            ],
            TieBreak::LowestPrice,
        );
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].price(), Some(1980));
        assert_eq!(title(&out[0]), Some("Mouse (Sponsored)"));
    }

    #[test]
    fn first_seen_keeps_earliest_message() {
        let msg = |rank: usize, text: Option<&str>| CanonicalRecord {
            payload: Payload::Message(Message {
                channel: "general".into(),
                user: format!("U{}", rank),
                text: text.map(str::to_string),
                permalink: None,
            }),
            ..product("1726752000.000100", rank, None, None)
        };
        let out = deduplicate(vec![msg(1, None), msg(2, Some("hello"))], TieBreak::FirstSeen);
        assert_eq!(out.len(), 1);
        match &out[0].payload {
            Payload::Message(m) => {
                assert_eq!(m.user, "U1");
                assert_eq!(m.text.as_deref(), Some("hello"));
            }
            other => panic!("expected message, got {:?}", other),
        }
    }
}
