//! XML documents: settings uploads, stimulation journals and scripts.
//!
//! All three formats share a small element tree ([`Element`]) read and written with
//! `quick-xml`. Settings documents address hardware with 1-indexed identifier-set
//! expressions:
//!
//! ```xml
//! <Program>
//!     <Settings>
//!         <RecordingSettings>
//!             <Channel box="1" probe="-" channel="1-64" references="b,2" gain="1" input="0"/>
//!         </RecordingSettings>
//!         <StimulationWaveformSettings>
//!             <Configuration box="1" probe="1" stimunit="1-8" polarity="0" pulses="20" .../>
//!         </StimulationWaveformSettings>
//!         <StimulationMappingSettings>
//!             <Mapping box="1" probe="1" stimunit="1" electrodes="1,5,22"/>
//!         </StimulationMappingSettings>
//!     </Settings>
//! </Program>
//! ```
//!
//! Settings entries are collected in document order wherever they appear, so a bare
//! `<RecordingSettings>` root is accepted as well.

use std::path::Path;

use quick_xml::events::{BytesDecl, BytesEnd, BytesStart, Event};
use quick_xml::{Reader, Writer};

use crate::error::{AppResult, ViperError};
use crate::settings::{StimParam, StimUnitSettings};
use crate::validation::{RecordAddress, SettingRecord};

/// A parsed XML element. Text content is ignored by every document format.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Element {
    pub name: String,
    pub attributes: Vec<(String, String)>,
    pub children: Vec<Element>,
}

impl Element {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    /// Builder-style attribute append.
    pub fn with_attr(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.attributes.push((key.into(), value.into()));
        self
    }

    pub fn attr(&self, key: &str) -> Option<&str> {
        self.attributes
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    pub fn required(&self, key: &str) -> AppResult<&str> {
        self.attr(key).ok_or_else(|| ViperError::MissingAttribute {
            element: self.name.clone(),
            attribute: key.to_string(),
        })
    }

    pub fn required_f64(&self, key: &str) -> AppResult<f64> {
        let raw = self.required(key)?;
        raw.trim().parse().map_err(|_| ViperError::InvalidNumber {
            attribute: key.to_string(),
            value: raw.to_string(),
        })
    }

    pub fn required_i64(&self, key: &str) -> AppResult<i64> {
        let raw = self.required(key)?;
        raw.trim().parse().map_err(|_| ViperError::InvalidNumber {
            attribute: key.to_string(),
            value: raw.to_string(),
        })
    }

    /// Optional numeric attribute; present but unparsable values are an error.
    pub fn optional_f64(&self, key: &str) -> AppResult<Option<f64>> {
        match self.attr(key) {
            Some(_) => self.required_f64(key).map(Some),
            None => Ok(None),
        }
    }

    /// Depth-first walk over this element and all of its descendants.
    pub fn descendants(&self) -> Vec<&Element> {
        let mut out = vec![self];
        for child in &self.children {
            out.extend(child.descendants());
        }
        out
    }

    fn from_start(start: &BytesStart<'_>) -> AppResult<Self> {
        let name = String::from_utf8_lossy(start.name().as_ref()).into_owned();
        let mut element = Element::new(name);
        for attr in start.attributes() {
            let attr = attr.map_err(quick_xml::Error::from)?;
            let key = String::from_utf8_lossy(attr.key.as_ref()).into_owned();
            let value = attr.unescape_value()?.into_owned();
            element.attributes.push((key, value));
        }
        Ok(element)
    }
}

/// Parse an XML string into its root element.
pub fn parse_document(xml: &str) -> AppResult<Element> {
    let mut reader = Reader::from_str(xml);
    reader.trim_text(true);

    let mut stack: Vec<Element> = Vec::new();
    let mut root: Option<Element> = None;

    fn attach(stack: &mut [Element], root: &mut Option<Element>, element: Element) -> AppResult<()> {
        if let Some(parent) = stack.last_mut() {
            parent.children.push(element);
        } else if root.is_some() {
            return Err(ViperError::Document(
                "document has more than one root element".to_string(),
            ));
        } else {
            *root = Some(element);
        }
        Ok(())
    }

    loop {
        match reader.read_event()? {
            Event::Start(start) => stack.push(Element::from_start(&start)?),
            Event::Empty(start) => {
                let element = Element::from_start(&start)?;
                attach(&mut stack, &mut root, element)?;
            }
            Event::End(_) => {
                let element = stack.pop().ok_or_else(|| {
                    ViperError::Document("unexpected closing tag".to_string())
                })?;
                attach(&mut stack, &mut root, element)?;
            }
            Event::Eof => break,
            _ => {}
        }
    }

    if let Some(open) = stack.last() {
        return Err(ViperError::Document(format!(
            "element '{}' is never closed",
            open.name
        )));
    }
    root.ok_or_else(|| ViperError::Document("document is empty".to_string()))
}

/// Read and parse an XML file.
pub fn read_document(path: &Path) -> AppResult<Element> {
    let xml = std::fs::read_to_string(path)?;
    parse_document(&xml)
}

/// Render an element tree with an XML declaration and four-space indentation.
pub fn render_document(root: &Element) -> AppResult<String> {
    let mut writer = Writer::new_with_indent(Vec::new(), b' ', 4);
    writer.write_event(Event::Decl(BytesDecl::new("1.0", Some("UTF-8"), None)))?;
    write_element(&mut writer, root)?;
    String::from_utf8(writer.into_inner())
        .map_err(|e| ViperError::Document(format!("rendered document is not UTF-8: {e}")))
}

fn write_element(writer: &mut Writer<Vec<u8>>, element: &Element) -> AppResult<()> {
    let mut start = BytesStart::new(element.name.as_str());
    for (key, value) in &element.attributes {
        start.push_attribute((key.as_str(), value.as_str()));
    }
    if element.children.is_empty() {
        writer.write_event(Event::Empty(start))?;
    } else {
        writer.write_event(Event::Start(start))?;
        for child in &element.children {
            write_element(writer, child)?;
        }
        writer.write_event(Event::End(BytesEnd::new(element.name.as_str())))?;
    }
    Ok(())
}

fn address(element: &Element) -> AppResult<RecordAddress> {
    Ok(RecordAddress {
        boxes: element.required("box")?.to_string(),
        probes: element.required("probe")?.to_string(),
    })
}

/// Convert a `Channel`, `Configuration` or `Mapping` element into a setting record.
///
/// Returns `Ok(None)` for any other element.
pub fn record_from_element(element: &Element) -> AppResult<Option<SettingRecord>> {
    let record = match element.name.as_str() {
        "Channel" => SettingRecord::Channel {
            address: address(element)?,
            channels: element.required("channel")?.to_string(),
            references: element.required("references")?.to_string(),
            gain: element.required("gain")?.to_string(),
            input: element.required("input")?.to_string(),
        },
        "Configuration" => {
            let mut values = Vec::with_capacity(StimParam::ALL.len());
            for param in StimParam::ALL {
                values.push((param, element.required_i64(param.name())?));
            }
            SettingRecord::Waveform {
                address: address(element)?,
                stim_units: element.required("stimunit")?.to_string(),
                values,
            }
        }
        "Mapping" => SettingRecord::Mapping {
            address: address(element)?,
            stim_units: element.required("stimunit")?.to_string(),
            electrodes: element.required("electrodes")?.to_string(),
        },
        _ => return Ok(None),
    };
    Ok(Some(record))
}

/// Every setting record of a document, in document order.
pub fn settings_records(root: &Element) -> AppResult<Vec<SettingRecord>> {
    let mut records = Vec::new();
    for element in root.descendants() {
        if let Some(record) = record_from_element(element)? {
            records.push(record);
        }
    }
    Ok(records)
}

/// Parse a settings document string straight into records.
pub fn parse_settings(xml: &str) -> AppResult<Vec<SettingRecord>> {
    settings_records(&parse_document(xml)?)
}

/// Built-in recording settings: every channel of every probe on the bulk reference.
pub fn default_recording_document() -> Element {
    let channel = Element::new("Channel")
        .with_attr("box", "-")
        .with_attr("probe", "-")
        .with_attr("channel", "-")
        .with_attr("references", "b")
        .with_attr("gain", "0")
        .with_attr("input", "0");
    let mut group = Element::new("RecordingSettings");
    group.children.push(channel);
    wrap_program(group)
}

/// Built-in stimulation settings: default waveform on every unit, unit 1 driving electrode 1.
pub fn default_stimulation_document() -> Element {
    let defaults = StimUnitSettings::default();
    let mut configuration = Element::new("Configuration")
        .with_attr("box", "-")
        .with_attr("probe", "-")
        .with_attr("stimunit", "-");
    for param in StimParam::ALL {
        configuration = configuration.with_attr(param.name(), defaults.get(param).to_string());
    }
    let mut waveform = Element::new("StimulationWaveformSettings");
    waveform.children.push(configuration);

    let mapping = Element::new("Mapping")
        .with_attr("box", "-")
        .with_attr("probe", "-")
        .with_attr("stimunit", "1")
        .with_attr("electrodes", "1");
    let mut mappings = Element::new("StimulationMappingSettings");
    mappings.children.push(mapping);

    let mut program = wrap_program(waveform);
    if let Some(settings) = program.children.first_mut() {
        settings.children.push(mappings);
    }
    program
}

fn wrap_program(group: Element) -> Element {
    let mut settings = Element::new("Settings");
    settings.children.push(group);
    let mut program = Element::new("Program");
    program.children.push(settings);
    program
}
