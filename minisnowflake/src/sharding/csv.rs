//! CSV ingestion for INSERT INTO ... FROM.
//!
//! Ingestion always has the whole file in hand, so parsing is one-shot:
//! split the bytes into records up front, then type the fields against
//! the table schema.

use std::fs::read;
use std::path::Path;
use std::str::from_utf8;

use csv_core::{ReadRecordResult, Reader};

use super::{Error, Schema, Value};

/// Split a CSV file into records of UTF-8 fields. Quoting follows the
/// usual rules: fields may be double-quoted, `""` escapes a quote, and
/// quoted fields may contain commas and newlines.
fn parse_records(data: &[u8]) -> Result<Vec<Vec<String>>, Error> {
    let mut input = data.to_vec();
    // Terminate a trailing record that is missing its final newline.
    if input.last().is_some_and(|b| *b != b'\n') {
        input.push(b'\n');
    }

    // No record can outgrow the file, so buffers sized to the input
    // fit every record and the reader never reports a full buffer.
    let mut reader = Reader::new();
    let mut output = vec![0u8; input.len() + 1];
    let mut ends = vec![0usize; input.len() + 1];

    let mut records = vec![];
    let mut pos = 0;

    loop {
        let (result, read, _, end_count) =
            reader.read_record(&input[pos..], &mut output, &mut ends);
        pos += read;

        match result {
            ReadRecordResult::Record => {
                let mut fields = Vec::with_capacity(end_count);
                let mut start = 0;
                for end in &ends[..end_count] {
                    let field = from_utf8(&output[start..*end])
                        .map_err(|_| Error::Csv("file is not valid UTF-8".into()))?;
                    fields.push(field.to_string());
                    start = *end;
                }
                records.push(fields);
            }

            ReadRecordResult::InputEmpty | ReadRecordResult::End => break,

            ReadRecordResult::OutputFull | ReadRecordResult::OutputEndsFull => {
                return Err(Error::Csv("record larger than the file".into()));
            }
        }
    }

    Ok(records)
}

/// Read a headered CSV file into typed rows ordered by the schema.
///
/// The header must name every schema column; column order in the file is
/// free. Empty fields decode to NULL and violate NOT NULL columns.
pub fn read_csv_file(path: &Path, schema: &Schema) -> Result<Vec<Vec<Value>>, Error> {
    let mut records = parse_records(&read(path)?)?.into_iter();

    let header = records
        .next()
        .ok_or_else(|| Error::Csv("empty file, expected a header".into()))?;

    let mut field_for_column = Vec::with_capacity(schema.columns.len());
    for column in &schema.columns {
        let index = header
            .iter()
            .position(|name| name == &column.name)
            .ok_or_else(|| Error::Csv(format!("header is missing column \"{}\"", column.name)))?;
        field_for_column.push(index);
    }

    let mut rows = vec![];

    for (index, record) in records.enumerate() {
        let line = index + 2;
        let mut row = Vec::with_capacity(schema.columns.len());

        for (column, field) in schema.columns.iter().zip(field_for_column.iter()) {
            let text = record
                .get(*field)
                .ok_or_else(|| Error::Csv(format!("line {}: too few fields", line)))?;
            let value = Value::from_text(text, &column.data_type)
                .map_err(|err| Error::Csv(format!("line {}: {}", line, err)))?;

            if value.is_null() && column.not_null {
                return Err(Error::NullViolation(column.name.clone()));
            }

            row.push(value);
        }

        rows.push(row);
    }

    Ok(rows)
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::sharding::{Column, DataType};
    use std::io::Write as _;

    fn schema() -> Schema {
        Schema::new(vec![
            Column {
                name: "id".into(),
                data_type: DataType::Integer,
                not_null: true,
            },
            Column {
                name: "value".into(),
                data_type: DataType::Double,
                not_null: false,
            },
            Column {
                name: "name".into(),
                data_type: DataType::Varchar,
                not_null: false,
            },
        ])
    }

    #[test]
    fn test_parse_records() {
        let records = parse_records(b"a,b,c\n1,2,3\n").unwrap();
        assert_eq!(
            records,
            vec![vec!["a", "b", "c"], vec!["1", "2", "3"]]
        );
    }

    #[test]
    fn test_parse_records_quoting() {
        let records = parse_records(b"name,note\n\"Smith, Jane\",\"said \"\"hi\"\"\"\n").unwrap();
        assert_eq!(records[1][0], "Smith, Jane");
        assert_eq!(records[1][1], "said \"hi\"");
    }

    #[test]
    fn test_parse_records_trailing_record_without_newline() {
        let records = parse_records(b"a,b\nc,d").unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[1], vec!["c", "d"]);
    }

    #[test]
    fn test_parse_records_empty_input() {
        assert!(parse_records(b"").unwrap().is_empty());
    }

    #[test]
    fn test_read_csv_file_typed() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("rows.csv");
        let mut file = std::fs::File::create(&path).unwrap();
        write!(file, "id,value,name\n1,1.5,click\n2,,\n").unwrap();

        let rows = read_csv_file(&path, &schema()).unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0][0], Value::Bigint(1));
        assert_eq!(rows[0][1], Value::Double(1.5));
        assert_eq!(rows[1][1], Value::Null);
        assert_eq!(rows[1][2], Value::Null);
    }

    #[test]
    fn test_read_csv_file_reordered_header() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("rows.csv");
        let mut file = std::fs::File::create(&path).unwrap();
        write!(file, "name,id,value\nclick,7,0.5\n").unwrap();

        let rows = read_csv_file(&path, &schema()).unwrap();
        assert_eq!(rows[0][0], Value::Bigint(7));
        assert_eq!(rows[0][2], Value::Text("click".into()));
    }

    #[test]
    fn test_read_csv_file_missing_header_column() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("rows.csv");
        let mut file = std::fs::File::create(&path).unwrap();
        write!(file, "id,value\n1,1.0\n").unwrap();

        let err = read_csv_file(&path, &schema()).unwrap_err();
        assert!(err.to_string().contains("name"));
    }

    #[test]
    fn test_read_csv_file_not_null() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("rows.csv");
        let mut file = std::fs::File::create(&path).unwrap();
        write!(file, "id,value,name\n,1.0,x\n").unwrap();

        let err = read_csv_file(&path, &schema()).unwrap_err();
        assert!(matches!(err, Error::NullViolation(_)));
    }
}
