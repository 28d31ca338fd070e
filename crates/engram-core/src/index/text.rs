//! Inverted term index and BM25 ranking
//!
//! One `__inv_<table>` store per table. Term keys map to posting lists;
//! per-document lengths and corpus statistics live under NUL-prefixed keys
//! in the same store, which can never collide with tokens because the
//! tokenizer only emits alphanumeric text.

use std::collections::HashMap;
use std::ops::Bound;

use serde::{Deserialize, Serialize};

use crate::error::DbResult;
use crate::kv::{KvRead, WriteTxn};

/// Okapi BM25 term-frequency saturation
const BM25_K1: f32 = 1.2;
/// Okapi BM25 length normalization
const BM25_B: f32 = 0.75;

const STATS_KEY: &[u8] = b"\x00stats";
const DOCLEN_PREFIX: &[u8] = b"\x00len\x00";

/// One posting: a document/field pair with its term frequency
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Posting {
    /// Encoded primary key of the document
    pub pk: Vec<u8>,
    /// Field the term occurred in
    pub field: String,
    /// Occurrences of the term in that field
    pub tf: u32,
}

/// Corpus statistics for BM25 length normalization
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct CorpusStats {
    /// Indexed documents
    pub doc_count: u64,
    /// Sum of document lengths in tokens
    pub total_len: u64,
}

impl CorpusStats {
    fn avg_doc_len(&self) -> f32 {
        if self.doc_count == 0 {
            0.0
        } else {
            self.total_len as f32 / self.doc_count as f32
        }
    }
}

/// Deterministic, locale-independent tokenizer.
///
/// Splits on non-alphanumeric boundaries; ASCII is lower-cased directly,
/// non-ASCII goes through the Unicode default case fold. Stop tokens are
/// elided after folding.
pub fn tokenize(text: &str, stop_words: &[String]) -> Vec<String> {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
        .map(fold_token)
        .filter(|t| !stop_words.contains(t))
        .collect()
}

fn fold_token(token: &str) -> String {
    if token.is_ascii() {
        token.to_ascii_lowercase()
    } else {
        token.to_lowercase()
    }
}

fn doclen_key(pk: &[u8]) -> Vec<u8> {
    let mut key = DOCLEN_PREFIX.to_vec();
    key.extend_from_slice(pk);
    key
}

fn read_stats<R: KvRead>(reader: &R, store: &str) -> DbResult<CorpusStats> {
    Ok(match reader.get(store, STATS_KEY)? {
        Some(raw) => bincode::deserialize(&raw)?,
        None => CorpusStats::default(),
    })
}

fn write_stats(txn: &mut WriteTxn, store: &str, stats: &CorpusStats) -> DbResult<()> {
    txn.put(store, STATS_KEY.to_vec(), bincode::serialize(stats)?)
}

fn read_postings<R: KvRead>(reader: &R, store: &str, term: &str) -> DbResult<Vec<Posting>> {
    Ok(match reader.get(store, term.as_bytes())? {
        Some(raw) => bincode::deserialize(&raw)?,
        None => Vec::new(),
    })
}

/// Per-field term frequencies for one document
fn term_frequencies(
    fields: &[(String, String)],
    stop_words: &[String],
) -> (HashMap<(String, String), u32>, u64) {
    let mut tf: HashMap<(String, String), u32> = HashMap::new();
    let mut doc_len = 0u64;
    for (field, text) in fields {
        for token in tokenize(text, stop_words) {
            doc_len += 1;
            *tf.entry((token, field.clone())).or_insert(0) += 1;
        }
    }
    (tf, doc_len)
}

/// Add one document's searchable fields to the index
pub fn index_document(
    txn: &mut WriteTxn,
    store: &str,
    pk: &[u8],
    fields: &[(String, String)],
    stop_words: &[String],
) -> DbResult<()> {
    let (tf, doc_len) = term_frequencies(fields, stop_words);
    for ((term, field), count) in tf {
        let mut postings = read_postings(txn, store, &term)?;
        postings.retain(|p| !(p.pk == pk && p.field == field));
        postings.push(Posting {
            pk: pk.to_vec(),
            field,
            tf: count,
        });
        txn.put(store, term.into_bytes(), bincode::serialize(&postings)?)?;
    }

    let mut stats = read_stats(txn, store)?;
    stats.doc_count += 1;
    stats.total_len += doc_len;
    write_stats(txn, store, &stats)?;
    txn.put(
        store,
        doclen_key(pk),
        bincode::serialize(&(doc_len as u32))?,
    )?;
    Ok(())
}

/// Remove one document from the index, given the field text it was indexed
/// under
pub fn deindex_document(
    txn: &mut WriteTxn,
    store: &str,
    pk: &[u8],
    fields: &[(String, String)],
    stop_words: &[String],
) -> DbResult<()> {
    let (tf, doc_len) = term_frequencies(fields, stop_words);
    for (term, _) in tf.keys() {
        let mut postings = read_postings(txn, store, term)?;
        postings.retain(|p| p.pk != pk);
        if postings.is_empty() {
            txn.delete(store, term.as_bytes().to_vec())?;
        } else {
            txn.put(store, term.as_bytes().to_vec(), bincode::serialize(&postings)?)?;
        }
    }

    let mut stats = read_stats(txn, store)?;
    stats.doc_count = stats.doc_count.saturating_sub(1);
    stats.total_len = stats.total_len.saturating_sub(doc_len);
    write_stats(txn, store, &stats)?;
    txn.delete(store, doclen_key(pk))?;
    Ok(())
}

/// BM25 scores for a tokenized query, keyed by encoded primary key.
///
/// A term absent from every document contributes nothing; a query with no
/// matching term returns an empty map.
pub fn bm25_scores<R: KvRead>(
    reader: &R,
    store: &str,
    query_terms: &[String],
) -> DbResult<HashMap<Vec<u8>, f32>> {
    let stats = read_stats(reader, store)?;
    if stats.doc_count == 0 {
        return Ok(HashMap::new());
    }
    let avg_len = stats.avg_doc_len().max(1.0);
    let n = stats.doc_count as f32;

    let mut scores: HashMap<Vec<u8>, f32> = HashMap::new();
    for term in query_terms {
        let postings = read_postings(reader, store, term)?;
        if postings.is_empty() {
            continue;
        }

        // document frequency counts distinct documents, not fields
        let mut tf_by_doc: HashMap<&[u8], u32> = HashMap::new();
        for posting in &postings {
            *tf_by_doc.entry(posting.pk.as_slice()).or_insert(0) += posting.tf;
        }
        let df = tf_by_doc.len() as f32;
        let idf = (1.0 + (n - df + 0.5) / (df + 0.5)).ln();

        for (pk, tf) in tf_by_doc {
            let doc_len = match reader.get(store, &doclen_key(pk))? {
                Some(raw) => bincode::deserialize::<u32>(&raw)? as f32,
                None => avg_len,
            };
            let tf = tf as f32;
            let norm = tf * (BM25_K1 + 1.0)
                / (tf + BM25_K1 * (1.0 - BM25_B + BM25_B * doc_len / avg_len));
            *scores.entry(pk.to_vec()).or_insert(0.0) += idf * norm;
        }
    }
    Ok(scores)
}

/// Number of distinct terms in the index (excluding bookkeeping keys)
pub fn term_count<R: KvRead>(reader: &R, store: &str) -> DbResult<usize> {
    let entries = reader.scan(
        store,
        (Bound::Included(vec![0x01]), Bound::Unbounded),
        crate::kv::Direction::Forward,
    )?;
    Ok(entries.len())
}
