//! Correction files (XML) and point sets (JSON).
//!
//! A correction file lists every calibration point with its position and
//! the six coefficients of each dimension's local fit, for inspection. The
//! field itself is reloaded only from the base64 `serialized_form` element,
//! which holds the JSON snapshot of the field. Writing a reloaded field
//! therefore reproduces the original file byte for byte.

use std::fs;
use std::path::Path;

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use chromacorr_core::CalibrationPoint;
use quick_xml::events::{BytesDecl, BytesEnd, BytesStart, BytesText, Event};
use quick_xml::{Reader, Writer};

use crate::error::CorrectionError;
use crate::field::{decode_snapshot, CorrectionField, LocalQuadraticFit};

const ROOT: &str = "correction";
const POINT: &str = "point";
const SNAPSHOT: &str = "serialized_form";
const DIMENSION_TAGS: [&str; 3] = [
    "x_dimension_parameters",
    "y_dimension_parameters",
    "z_dimension_parameters",
];

#[derive(thiserror::Error, Debug)]
pub enum CorrectionIoError {
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Xml(#[from] quick_xml::Error),
    #[error(transparent)]
    Base64(#[from] base64::DecodeError),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
    #[error(transparent)]
    Utf8(#[from] std::str::Utf8Error),
    #[error("correction file has no serialized_form element")]
    MissingSnapshot,
    #[error("stored correction is invalid: {0}")]
    InvalidSnapshot(#[source] CorrectionError),
}

fn join_coefficients(fit: &LocalQuadraticFit) -> String {
    fit.coefficients
        .iter()
        .map(|c| c.to_string())
        .collect::<Vec<_>>()
        .join(", ")
}

fn text_element(
    writer: &mut Writer<Vec<u8>>,
    name: &str,
    attributes: &[(&str, &str)],
    text: &str,
) -> std::io::Result<()> {
    let mut start = BytesStart::new(name);
    for &attribute in attributes {
        start.push_attribute(attribute);
    }
    writer.write_event(Event::Start(start))?;
    writer.write_event(Event::Text(BytesText::new(text)))?;
    writer.write_event(Event::End(BytesEnd::new(name)))
}

/// Render `field` as a correction document.
pub fn correction_to_xml(field: &CorrectionField) -> Result<String, CorrectionIoError> {
    let mut writer = Writer::new_with_indent(Vec::new(), b' ', 2);
    writer.write_event(Event::Decl(BytesDecl::new("1.0", Some("UTF-8"), None)))?;

    let count = field.len().to_string();
    let reference = field.reference_channel().to_string();
    let target = field.correction_channel().to_string();
    let mut root = BytesStart::new(ROOT);
    root.push_attribute(("n", count.as_str()));
    root.push_attribute(("reference_channel", reference.as_str()));
    root.push_attribute(("correction_channel", target.as_str()));
    writer.write_event(Event::Start(root))?;

    for local in field.locals() {
        let [x, y, z] = [local.position.x, local.position.y, local.position.z].map(|v| v.to_string());
        let mut point = BytesStart::new(POINT);
        point.push_attribute(("x_position", x.as_str()));
        point.push_attribute(("y_position", y.as_str()));
        point.push_attribute(("z_position", z.as_str()));
        writer.write_event(Event::Start(point))?;
        for (tag, fit) in DIMENSION_TAGS.iter().zip(&local.fits) {
            text_element(&mut writer, tag, &[], &join_coefficients(fit))?;
        }
        writer.write_event(Event::End(BytesEnd::new(POINT)))?;
    }

    let snapshot = STANDARD.encode(serde_json::to_vec(field)?);
    text_element(&mut writer, SNAPSHOT, &[("encoding", "base64")], &snapshot)?;
    writer.write_event(Event::End(BytesEnd::new(ROOT)))?;

    String::from_utf8(writer.into_inner()).map_err(|e| CorrectionIoError::Utf8(e.utf8_error()))
}

/// Restore a field from a correction document.
pub fn correction_from_xml(xml: &str) -> Result<CorrectionField, CorrectionIoError> {
    let mut reader = Reader::from_str(xml);
    let mut payload: Option<String> = None;
    let mut inside = false;

    loop {
        match reader.read_event()? {
            Event::Start(e) if e.name().as_ref() == SNAPSHOT.as_bytes() => {
                inside = true;
                payload.get_or_insert_with(String::new);
            }
            Event::End(e) if e.name().as_ref() == SNAPSHOT.as_bytes() => inside = false,
            Event::Text(t) if inside => {
                if let Some(buf) = payload.as_mut() {
                    buf.push_str(std::str::from_utf8(&t)?);
                }
            }
            Event::Eof => break,
            _ => {}
        }
    }

    let payload = payload.ok_or(CorrectionIoError::MissingSnapshot)?;
    let compact: String = payload.split_whitespace().collect();
    let bytes = STANDARD.decode(compact)?;
    decode_snapshot(&bytes)?.map_err(CorrectionIoError::InvalidSnapshot)
}

pub fn write_correction_file(
    field: &CorrectionField,
    path: impl AsRef<Path>,
) -> Result<(), CorrectionIoError> {
    let path = path.as_ref();
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)?;
    }
    fs::write(path, correction_to_xml(field)?)?;
    log::info!("wrote correction for {} points to {}", field.len(), path.display());
    Ok(())
}

pub fn read_correction_file(path: impl AsRef<Path>) -> Result<CorrectionField, CorrectionIoError> {
    let path = path.as_ref();
    let field = correction_from_xml(&fs::read_to_string(path)?)?;
    log::info!("read correction for {} points from {}", field.len(), path.display());
    Ok(field)
}

/// Load calibration or experimental points from a JSON array.
pub fn load_points_json(path: impl AsRef<Path>) -> Result<Vec<CalibrationPoint>, CorrectionIoError> {
    let raw = fs::read_to_string(path)?;
    Ok(serde_json::from_str(&raw)?)
}

/// Write points as pretty JSON.
pub fn write_points_json(
    points: &[CalibrationPoint],
    path: impl AsRef<Path>,
) -> Result<(), CorrectionIoError> {
    let json = serde_json::to_string_pretty(points)?;
    fs::write(path, json)?;
    Ok(())
}

/// Write one distance per line.
pub fn write_distances(distances: &[f64], path: impl AsRef<Path>) -> Result<(), CorrectionIoError> {
    let mut out = String::with_capacity(distances.len() * 20);
    for d in distances {
        out.push_str(&d.to_string());
        out.push('\n');
    }
    fs::write(path, out)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::field::LocalCorrection;
    use chromacorr_core::ChannelPair;
    use nalgebra::Point3;

    fn small_field() -> CorrectionField {
        let local = |label: u32, x: f64, c: [f64; 6]| LocalCorrection {
            label,
            position: Point3::new(x, 2.5, 7.0),
            radius: 12.75,
            fits: [
                LocalQuadraticFit::new(c),
                LocalQuadraticFit::new([0.1; 6]),
                LocalQuadraticFit::new([-1e-7, 0.0, 3.0, 0.0, 0.0, 1.0 / 3.0]),
            ],
        };
        CorrectionField::new(
            ChannelPair::new(1, 0),
            vec![
                local(4, 0.0, [0.25, -0.5, 1e-3, 2.0, 0.0, 0.0]),
                local(9, 10.0, [1.0, 2.0, 3.0, 4.0, 5.0, 6.0]),
            ],
        )
        .expect("field")
    }

    #[test]
    fn document_lists_points_and_coefficients() {
        let xml = correction_to_xml(&small_field()).expect("xml");
        assert!(xml.starts_with("<?xml version=\"1.0\" encoding=\"UTF-8\"?>"));
        assert!(xml.contains(r#"<correction n="2" reference_channel="1" correction_channel="0">"#));
        assert!(xml.contains(r#"<point x_position="10" y_position="2.5" z_position="7">"#));
        assert!(xml.contains("<x_dimension_parameters>0.25, -0.5, 0.001, 2, 0, 0</x_dimension_parameters>"));
        assert!(xml.contains(r#"<serialized_form encoding="base64">"#));
    }

    #[test]
    fn reload_reproduces_the_document() {
        let field = small_field();
        let xml = correction_to_xml(&field).expect("xml");
        let back = correction_from_xml(&xml).expect("reload");
        assert_eq!(back, field);
        assert_eq!(correction_to_xml(&back).expect("xml"), xml);
    }

    #[test]
    fn readable_fields_are_not_reparsed() {
        let xml = correction_to_xml(&small_field()).expect("xml");
        let edited = xml.replace(r#"x_position="10""#, r#"x_position="99""#);
        let back = correction_from_xml(&edited).expect("reload");
        assert_eq!(back.locals()[1].position.x, 10.0);
    }

    #[test]
    fn missing_or_corrupt_snapshot_is_an_error() {
        let bare = r#"<?xml version="1.0"?><correction n="0"></correction>"#;
        assert!(matches!(
            correction_from_xml(bare),
            Err(CorrectionIoError::MissingSnapshot)
        ));

        let garbage = r#"<correction><serialized_form encoding="base64">@@@</serialized_form></correction>"#;
        assert!(matches!(
            correction_from_xml(garbage),
            Err(CorrectionIoError::Base64(_))
        ));

        let empty_points = STANDARD.encode(r#"{"reference_channel":0,"correction_channel":1,"points":[]}"#);
        let invalid = format!("<correction><serialized_form>{empty_points}</serialized_form></correction>");
        assert!(matches!(
            correction_from_xml(&invalid),
            Err(CorrectionIoError::InvalidSnapshot(CorrectionError::InvalidField(_)))
        ));
    }

    #[test]
    fn files_round_trip() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("nested").join("20240101_correction.xml");
        let field = small_field();
        write_correction_file(&field, &path).expect("write");
        assert_eq!(read_correction_file(&path).expect("read"), field);

        let points = vec![CalibrationPoint::from_positions(
            3,
            &[Point3::new(1.0, 2.0, 3.0), Point3::new(1.5, 2.5, 3.5)],
        )];
        let points_path = dir.path().join("points.json");
        write_points_json(&points, &points_path).expect("write points");
        assert_eq!(load_points_json(&points_path).expect("load points"), points);

        let distances_path = dir.path().join("diffs.txt");
        write_distances(&[1.5, 20.25], &distances_path).expect("write distances");
        assert_eq!(fs::read_to_string(&distances_path).expect("read"), "1.5\n20.25\n");
    }
}
