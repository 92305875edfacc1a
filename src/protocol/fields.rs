use crate::error::{JobdError, Result};
use crate::protocol::message::{field::Value, Field, Item, KeyValue, Request, StringArray, StringMap};

macro_rules! field_numbers {
    ($($variant:ident = $num:literal => $name:literal,)*) => {
        /// Stable numeric field codes shared by clients, agents and the server.
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        #[repr(u32)]
        pub enum FieldNumber {
            $($variant = $num,)*
        }

        impl FieldNumber {
            pub fn from_u32(number: u32) -> Option<Self> {
                match number {
                    $($num => Some(FieldNumber::$variant),)*
                    _ => None,
                }
            }

            pub fn name(self) -> &'static str {
                match self {
                    $(FieldNumber::$variant => $name,)*
                }
            }
        }
    };
}

field_numbers! {
    JobId = 1 => "JOBID",
    JobName = 2 => "JOBNAME",
    QueueName = 3 => "QUEUENAME",
    State = 4 => "STATE",
    Uid = 5 => "UID",
    Priority = 6 => "PRIORITY",
    SubmitTime = 7 => "SUBMITTIME",
    Nice = 8 => "NICE",
    Args = 9 => "ARGS",
    Stdout = 10 => "STDOUT",
    Stderr = 11 => "STDERR",
    DeferTime = 12 => "DEFERTIME",
    StartTime = 13 => "STARTTIME",
    FinishTime = 14 => "FINISHTIME",
    Tags = 15 => "TAGS",
    Shell = 16 => "SHELL",
    PreCmd = 17 => "PRECMD",
    PostCmd = 18 => "POSTCMD",
    Resources = 19 => "RESOURCES",
    ExitCode = 20 => "EXITCODE",
    Signal = 21 => "SIGNAL",
    Hold = 22 => "HOLD",
    Restart = 23 => "RESTART",
    Envs = 24 => "ENVS",
    Wrapper = 25 => "WRAPPER",
    ReturnFields = 26 => "RETFIELDS",
    TagKey = 27 => "TAG_KEY",
    TagValue = 28 => "TAG_VALUE",
    Description = 29 => "DESC",
    Node = 30 => "NODE",
    JobLimit = 31 => "JOBLIMIT",
    QueueState = 32 => "QUEUESTATE",
    Default = 33 => "DEFAULT",
    ResName = 34 => "RESNAME",
    ResCount = 35 => "RESCOUNT",
    ResInUse = 36 => "RESINUSE",
    Connected = 37 => "CONNECTED",
    Pid = 38 => "PID",
    ProxyData = 39 => "PROXYDATA",
    Nonce = 40 => "NONCE",
    AuthToken = 41 => "AUTHTOKEN",
    StatsRunning = 50 => "STATSRUNNING",
    StatsPending = 51 => "STATSPENDING",
    StatsDeferred = 52 => "STATSDEFERRED",
    StatsHolding = 53 => "STATSHOLDING",
    StatsCompleted = 54 => "STATSCOMPLETED",
    StatsExited = 55 => "STATSEXITED",
    StatsTotalSubmitted = 56 => "STATSTOTALSUBMITTED",
    StatsTotalStarted = 57 => "STATSTOTALSTARTED",
    StatsTotalCompleted = 58 => "STATSTOTALCOMPLETED",
    StatsTotalExited = 59 => "STATSTOTALEXITED",
    StatsTotalDeleted = 60 => "STATSTOTALDELETED",
}

impl Field {
    pub fn string(number: FieldNumber, value: impl Into<String>) -> Self {
        Self::with_value(number, Value::Str(value.into()))
    }

    pub fn int(number: FieldNumber, value: i64) -> Self {
        Self::with_value(number, Value::Int(value))
    }

    pub fn boolean(number: FieldNumber, value: bool) -> Self {
        Self::with_value(number, Value::Bool(value))
    }

    pub fn string_array(number: FieldNumber, values: Vec<String>) -> Self {
        Self::with_value(number, Value::StrArray(StringArray { values }))
    }

    pub fn string_map(number: FieldNumber, entries: Vec<KeyValue>) -> Self {
        Self::with_value(number, Value::StrMap(StringMap { entries }))
    }

    pub fn blob(number: FieldNumber, value: Vec<u8>) -> Self {
        Self::with_value(number, Value::Blob(value))
    }

    fn with_value(number: FieldNumber, value: Value) -> Self {
        Self {
            number: number as u32,
            value: Some(value),
        }
    }

    pub fn field_number(&self) -> Option<FieldNumber> {
        FieldNumber::from_u32(self.number)
    }

    fn type_error(&self, expected: &str) -> JobdError {
        let name = self
            .field_number()
            .map(FieldNumber::name)
            .unwrap_or("UNKNOWN");
        JobdError::Decode(format!("field {} ({}) is not a {}", self.number, name, expected))
    }

    pub fn as_string(&self) -> Result<String> {
        match &self.value {
            Some(Value::Str(s)) => Ok(s.clone()),
            _ => Err(self.type_error("string")),
        }
    }

    pub fn as_int(&self) -> Result<i64> {
        match &self.value {
            Some(Value::Int(i)) => Ok(*i),
            _ => Err(self.type_error("integer")),
        }
    }

    pub fn as_u64(&self) -> Result<u64> {
        let value = self.as_int()?;
        u64::try_from(value).map_err(|_| self.type_error("non-negative integer"))
    }

    pub fn as_u32(&self) -> Result<u32> {
        let value = self.as_int()?;
        u32::try_from(value).map_err(|_| self.type_error("32-bit unsigned integer"))
    }

    pub fn as_i32(&self) -> Result<i32> {
        let value = self.as_int()?;
        i32::try_from(value).map_err(|_| self.type_error("32-bit integer"))
    }

    pub fn as_bool(&self) -> Result<bool> {
        match &self.value {
            Some(Value::Bool(b)) => Ok(*b),
            _ => Err(self.type_error("boolean")),
        }
    }

    pub fn as_string_array(&self) -> Result<Vec<String>> {
        match &self.value {
            Some(Value::StrArray(a)) => Ok(a.values.clone()),
            _ => Err(self.type_error("string array")),
        }
    }

    pub fn as_string_map(&self) -> Result<Vec<KeyValue>> {
        match &self.value {
            Some(Value::StrMap(m)) => Ok(m.entries.clone()),
            _ => Err(self.type_error("string map")),
        }
    }

    pub fn as_blob(&self) -> Result<Vec<u8>> {
        match &self.value {
            Some(Value::Blob(b)) => Ok(b.clone()),
            _ => Err(self.type_error("blob")),
        }
    }
}

impl Item {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, field: Field) -> Self {
        self.fields.push(field);
        self
    }

    pub fn push(&mut self, field: Field) {
        self.fields.push(field);
    }

    pub fn get(&self, number: FieldNumber) -> Option<&Field> {
        self.fields.iter().find(|f| f.number == number as u32)
    }
}

impl KeyValue {
    pub fn new(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
        }
    }
}

/// Walk the fields of one request item, handing each known field to `visit`.
///
/// `visit` returns `Ok(false)` for fields the command has no use for. Those,
/// and numbers this server does not know, are logged and skipped so that
/// newer clients keep working. Any error from `visit` aborts decoding.
pub fn visit_fields<F>(verb: &str, item: &Item, mut visit: F) -> Result<()>
where
    F: FnMut(FieldNumber, &Field) -> Result<bool>,
{
    for field in &item.fields {
        let handled = match field.field_number() {
            Some(number) => visit(number, field)?,
            None => false,
        };

        if !handled {
            tracing::warn!(verb, field = field.number, "Unknown field encountered, ignoring");
        }
    }
    Ok(())
}

/// First item of a request, or an empty one. Most commands carry one item.
pub fn first_item(request: &Request) -> &Item {
    static EMPTY: Item = Item { fields: Vec::new() };
    request.items.first().unwrap_or(&EMPTY)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn field_numbers_are_stable() {
        assert_eq!(FieldNumber::JobId as u32, 1);
        assert_eq!(FieldNumber::from_u32(19), Some(FieldNumber::Resources));
        assert_eq!(FieldNumber::from_u32(9999), None);
        assert_eq!(FieldNumber::TagKey.name(), "TAG_KEY");
    }

    #[test]
    fn typed_accessors_reject_wrong_types() {
        let field = Field::string(FieldNumber::JobName, "build");
        assert_eq!(field.as_string().unwrap(), "build");
        assert!(matches!(field.as_int(), Err(JobdError::Decode(_))));

        let negative = Field::int(FieldNumber::JobId, -5);
        assert!(negative.as_u64().is_err());
        assert_eq!(negative.as_int().unwrap(), -5);
        assert_eq!(negative.as_i32().unwrap(), -5);

        let wide = Field::int(FieldNumber::ExitCode, 4_294_967_296);
        assert!(matches!(wide.as_i32(), Err(JobdError::Decode(_))));
    }

    #[test]
    fn visit_fields_skips_unknown_numbers() {
        let item = Item::new()
            .with(Field::string(FieldNumber::JobName, "a"))
            .with(Field {
                number: 4242,
                value: None,
            })
            .with(Field::int(FieldNumber::Priority, 7));

        let mut seen = Vec::new();
        visit_fields("TEST", &item, |number, _| {
            seen.push(number);
            Ok(number == FieldNumber::JobName)
        })
        .unwrap();

        assert_eq!(seen, vec![FieldNumber::JobName, FieldNumber::Priority]);
    }

    #[test]
    fn visit_fields_propagates_errors() {
        let item = Item::new().with(Field::string(FieldNumber::JobId, "not a number"));
        let result = visit_fields("TEST", &item, |number, field| {
            if number == FieldNumber::JobId {
                field.as_u64()?;
            }
            Ok(true)
        });
        assert!(result.is_err());
    }

    #[test]
    fn first_item_of_empty_request_is_empty() {
        let request = Request::default();
        assert!(first_item(&request).fields.is_empty());
    }
}
