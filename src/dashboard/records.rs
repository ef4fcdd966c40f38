//! Typed records for the mirrored dashboard partitions.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::cache::{CacheRecord, PartitionData, PartitionSpec};
use crate::sync::{DependentData, PrimaryData, RemoteDocument};

pub const CLIENTS: &str = "clients";
pub const PAYMENTS: &str = "payments";
pub const CALLS: &str = "calls";

/// Partitions of the dashboard mirror.
pub const DASHBOARD_SCHEMA: &[PartitionSpec] = &[
  PartitionSpec {
    name: CLIENTS,
    indexes: &["updatedAt"],
  },
  PartitionSpec {
    name: PAYMENTS,
    indexes: &["clientId", "date"],
  },
  PartitionSpec {
    name: CALLS,
    indexes: &["clientId"],
  },
];

/// Name shown for a client whose document has none.
pub const DEFAULT_CLIENT_NAME: &str = "Cliente";

/// Keys owned by [`CacheRecord`] that must not leak in from remote fields.
const RESERVED: &[&str] = &["id", "cacheUpdatedAt"];

pub type Client = CacheRecord<ClientRecord>;
pub type Payment = CacheRecord<PaymentRecord>;
pub type Call = CacheRecord<CallRecord>;

/// A client document, mirrored field for field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClientRecord {
  #[serde(flatten)]
  pub fields: Map<String, Value>,
}

impl ClientRecord {
  /// The `name` field, when it is a string.
  pub fn name(&self) -> Option<&str> {
    self.fields.get("name").and_then(Value::as_str)
  }

  pub fn display_name(&self) -> &str {
    self
      .name()
      .filter(|n| !n.is_empty())
      .unwrap_or(DEFAULT_CLIENT_NAME)
  }
}

impl PartitionData for ClientRecord {
  const PARTITION: &'static str = CLIENTS;
}

impl PrimaryData for ClientRecord {
  const COLLECTION: &'static str = CLIENTS;

  fn from_remote(doc: RemoteDocument) -> CacheRecord<Self> {
    let mut fields = doc.fields;
    strip(&mut fields, RESERVED);

    CacheRecord::stamp(doc.id, ClientRecord { fields })
  }
}

/// A payment from a client's `payments` sub-collection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PaymentRecord {
  pub doc_id: String,
  pub client_id: String,
  pub client_name: String,
  pub amount: f64,
  #[serde(default)]
  pub date: Option<Value>,
  pub is_renewal: bool,
  pub source: String,
  #[serde(flatten)]
  pub fields: Map<String, Value>,
}

impl PartitionData for PaymentRecord {
  const PARTITION: &'static str = PAYMENTS;
}

impl DependentData for PaymentRecord {
  type Parent = ClientRecord;
  const SUBCOLLECTION: &'static str = PAYMENTS;

  fn from_remote(parent: &Client, doc: RemoteDocument) -> CacheRecord<Self> {
    let mut fields = doc.fields;

    let amount = fields.get("amount").map_or(0.0, parse_amount);
    let is_renewal = matches!(fields.get("isRenewal"), Some(Value::Bool(true)));
    let date = ["paymentDate", "date", "createdAt"]
      .iter()
      .filter_map(|k| fields.get(*k))
      .find(|v| is_present(v))
      .cloned();

    strip(&mut fields, RESERVED);
    strip(
      &mut fields,
      &[
        "docId",
        "clientId",
        "clientName",
        "amount",
        "date",
        "isRenewal",
        "source",
      ],
    );

    CacheRecord::stamp(
      format!("{}_{}", parent.id, doc.id),
      PaymentRecord {
        doc_id: doc.id,
        client_id: parent.id.clone(),
        client_name: parent.data.display_name().to_string(),
        amount,
        date,
        is_renewal,
        source: "subcollection".to_string(),
        fields,
      },
    )
  }
}

/// A scheduled call from a client's `calls` sub-collection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallRecord {
  pub doc_id: String,
  pub client_id: String,
  pub client_name: String,
  #[serde(flatten)]
  pub fields: Map<String, Value>,
}

impl PartitionData for CallRecord {
  const PARTITION: &'static str = CALLS;
}

impl DependentData for CallRecord {
  type Parent = ClientRecord;
  const SUBCOLLECTION: &'static str = CALLS;

  fn from_remote(parent: &Client, doc: RemoteDocument) -> CacheRecord<Self> {
    let mut fields = doc.fields;
    strip(&mut fields, RESERVED);
    strip(&mut fields, &["docId", "clientId", "clientName"]);

    CacheRecord::stamp(
      format!("{}_{}", parent.id, doc.id),
      CallRecord {
        doc_id: doc.id,
        client_id: parent.id.clone(),
        client_name: parent.data.display_name().to_string(),
        fields,
      },
    )
  }
}

fn strip(fields: &mut Map<String, Value>, keys: &[&str]) {
  for key in keys {
    fields.remove(*key);
  }
}

/// Numbers as-is, numeric strings parsed, anything else 0.
fn parse_amount(value: &Value) -> f64 {
  let amount = match value {
    Value::Number(n) => n.as_f64().unwrap_or(0.0),
    Value::String(s) => s.trim().parse().unwrap_or(0.0),
    _ => 0.0,
  };
  if amount.is_finite() {
    amount
  } else {
    0.0
  }
}

/// Falsy values (null, "", false, 0) are skipped when picking a date.
fn is_present(value: &Value) -> bool {
  match value {
    Value::Null => false,
    Value::Bool(b) => *b,
    Value::String(s) => !s.is_empty(),
    Value::Number(n) => n.as_f64() != Some(0.0),
    _ => true,
  }
}
