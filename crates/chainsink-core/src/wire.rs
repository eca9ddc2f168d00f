//! Protobuf payload emitted by the upstream output module.
//!
//! ```text
//! message PublishOperations { repeated PublishMessage messages = 1; }
//! message PublishMessage {
//!   bytes data = 1;
//!   repeated Attribute attributes = 2;
//!   string ordering_key = 3;
//!   string topic = 4;   // empty = default destination
//! }
//! message Attribute { string key = 1; string value = 2; }
//! ```

#[derive(Clone, PartialEq, prost::Message)]
pub struct PublishOperations {
    #[prost(message, repeated, tag = "1")]
    pub messages: Vec<PublishMessage>,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct PublishMessage {
    #[prost(bytes = "vec", tag = "1")]
    pub data: Vec<u8>,
    #[prost(message, repeated, tag = "2")]
    pub attributes: Vec<Attribute>,
    #[prost(string, tag = "3")]
    pub ordering_key: String,
    #[prost(string, tag = "4")]
    pub topic: String,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct Attribute {
    #[prost(string, tag = "1")]
    pub key: String,
    #[prost(string, tag = "2")]
    pub value: String,
}

impl PublishMessage {
    /// A message for the default destination.
    pub fn new(data: impl Into<Vec<u8>>) -> Self {
        Self {
            data: data.into(),
            ..Default::default()
        }
    }

    pub fn topic(mut self, topic: impl Into<String>) -> Self {
        self.topic = topic.into();
        self
    }

    pub fn ordering_key(mut self, key: impl Into<String>) -> Self {
        self.ordering_key = key.into();
        self
    }

    pub fn attribute(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.attributes.push(Attribute {
            key: key.into(),
            value: value.into(),
        });
        self
    }
}
