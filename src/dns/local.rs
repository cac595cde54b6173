//! The local resolver, authoritative for custom zones.

use std::collections::HashMap;
use std::net::{Ipv4Addr, Ipv6Addr};
use std::str::FromStr;
use std::sync::RwLock;

use anyhow::{Context, Result};
use hickory_proto::op::{Message, ResponseCode};
use hickory_proto::rr::{rdata, DNSClass, Name, RData, Record, RecordType};
use tracing::trace;

use crate::netmap::SimpleRecord;

use super::service::response_from;

/// Serves exact-match lookups over the records management pushed for custom
/// zones.
#[derive(Debug, Default)]
pub struct LocalResolver {
    records: RwLock<HashMap<RecordKey, Record>>,
}

/// Lookup key of a registered record.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub(crate) struct RecordKey {
    name: String,
    class: DNSClass,
    rtype: RecordType,
}

impl RecordKey {
    fn new(name: &str, class: DNSClass, rtype: RecordType) -> Self {
        RecordKey {
            name: crate::util::with_dot(&name.to_ascii_lowercase()),
            class,
            rtype,
        }
    }
}

impl LocalResolver {
    /// Replaces the registered record set wholesale.
    ///
    /// Records that fail to convert are skipped with a warning by the
    /// caller, which validated classes beforehand.
    pub(crate) fn replace_records(&self, records: Vec<SimpleRecord>) {
        let mut map = HashMap::with_capacity(records.len());
        for record in records {
            match to_hickory_record(&record) {
                Ok((key, record)) => {
                    map.insert(key, record);
                }
                Err(err) => {
                    tracing::warn!("skipping unparseable record {record}: {err:#}");
                }
            }
        }
        *self.records.write().unwrap() = map;
    }

    pub(crate) fn record_count(&self) -> usize {
        self.records.read().unwrap().len()
    }

    /// Answers `query` from the registered records, exact match only.
    pub(crate) fn handle(&self, query: &Message) -> Message {
        let Some(question) = query.queries().first() else {
            return response_from(query, ResponseCode::FormErr, Vec::new());
        };
        let key = RecordKey::new(
            &question.name().to_utf8(),
            question.query_class(),
            question.query_type(),
        );
        trace!(name = %key.name, rtype = ?key.rtype, "local lookup");

        let found = self.records.read().unwrap().get(&key).cloned();
        match found {
            Some(record) => response_from(query, ResponseCode::NoError, vec![record]),
            None => response_from(query, ResponseCode::NXDomain, Vec::new()),
        }
    }
}

/// Converts a management record into a hickory record plus its lookup key.
fn to_hickory_record(record: &SimpleRecord) -> Result<(RecordKey, Record)> {
    use crate::netmap::RecordType as WireType;

    let name = Name::from_utf8(&record.name).context("invalid record name")?;
    let rdata = match record.record_type {
        WireType::A => {
            let addr = Ipv4Addr::from_str(&record.rdata).context("invalid A rdata")?;
            RData::A(rdata::A(addr))
        }
        WireType::AAAA => {
            let addr = Ipv6Addr::from_str(&record.rdata).context("invalid AAAA rdata")?;
            RData::AAAA(rdata::AAAA(addr))
        }
        WireType::CNAME => {
            let target = Name::from_utf8(&record.rdata).context("invalid CNAME rdata")?;
            RData::CNAME(rdata::CNAME(target))
        }
        WireType::TXT => RData::TXT(rdata::TXT::new(vec![record.rdata.clone()])),
    };

    let key = RecordKey::new(&record.name, DNSClass::IN, rdata.record_type());
    let record = Record::from_rdata(name, record.ttl, rdata);
    Ok((key, record))
}
