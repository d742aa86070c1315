use serde::ser::Serialize;
use serde_json::ser::{PrettyFormatter, Serializer};

use crate::context::AppContext;
use crate::error::ExportError;

#[derive(serde::Serialize)]
#[serde(rename_all = "camelCase")]
struct JsonField<'a> {
    id: &'a str,
    name: &'a str,
    raw_value: f64,
}

/// Pretty-prints the current fields of the primary consolidator as a JSON
/// array of `{id, name, rawValue}`, indented by four spaces.
pub fn render_json(context: &AppContext) -> Result<String, ExportError> {
    let headers = context.consolidator.sorted_headers();
    let fields = context.specification.packet_fields(&headers)?;

    let data: Vec<JsonField> = fields
        .iter()
        .map(|field| JsonField {
            id: &field.id,
            name: &field.name,
            raw_value: field.raw_value,
        })
        .collect();

    let mut buffer = Vec::new();
    let mut serializer = Serializer::with_formatter(&mut buffer, PrettyFormatter::with_indent(b"    "));
    data.serialize(&mut serializer)?;

    // serde_json only writes valid UTF-8
    Ok(String::from_utf8_lossy(&buffer).into_owned())
}
