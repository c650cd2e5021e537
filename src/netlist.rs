//! Pack netlist: the resistive circuit coupling every cell.
//!
//! One element per row with columns `desc node1 node2 value`. The element
//! kind is carried by the description prefix:
//!
//! ```text
//! V<k>    cell open-circuit voltage source (node1 = positive)
//! Ri<k>   cell internal resistance
//! R<...>  any other resistor (busbars Rb, cell connections Rc)
//! I<k>    terminal current injection, drawn out of node1 into node2
//! ```
//!
//! Node 0 is ground (pack negative). Topology is fixed once built; the
//! solver only rewrites `value` on V, Ri and I rows between steps.
//!
//! # Text format
//!
//! ```text
//! # comment
//! V0 1 0 3.7
//! Ri0 1 2 5m
//! I0 3 0 10
//! ```

use std::io::Write;

use nom::branch::alt;
use nom::bytes::complete::{tag_no_case, take_while1};
use nom::character::complete::{digit1, space1};
use nom::combinator::{map, map_res, opt};
use nom::number::complete::double;
use nom::IResult;
use nom::Parser;

use crate::error::{PackError, Result};

/// Circuit element kind, decided by the description prefix.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ElementKind {
    VoltageSource,
    InternalResistance,
    Resistor,
    CurrentSource,
}

impl ElementKind {
    /// Prefixes are matched case-insensitively.
    pub fn from_desc(desc: &str) -> Result<Self> {
        if desc.get(..2).is_some_and(|p| p.eq_ignore_ascii_case("ri")) {
            return Ok(ElementKind::InternalResistance);
        }
        match desc.chars().next().map(|c| c.to_ascii_uppercase()) {
            Some('R') => Ok(ElementKind::Resistor),
            Some('V') => Ok(ElementKind::VoltageSource),
            Some('I') => Ok(ElementKind::CurrentSource),
            _ => Err(PackError::Netlist(format!(
                "unknown element kind for description '{desc}'"
            ))),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Element {
    pub desc: String,
    pub kind: ElementKind,
    pub node1: usize,
    pub node2: usize,
    pub value: f64,
}

impl Element {
    pub fn new(desc: impl Into<String>, node1: usize, node2: usize, value: f64) -> Result<Self> {
        let desc = desc.into();
        let kind = ElementKind::from_desc(&desc)?;
        Ok(Self {
            desc,
            kind,
            node1,
            node2,
            value,
        })
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Netlist {
    pub elements: Vec<Element>,
}

/// Row indices of the mutable element columns, in netlist order.
///
/// Voltage source `k` and internal resistance `k` both belong to cell `k`.
#[derive(Debug, Clone, PartialEq)]
pub struct NetlistMap {
    pub voltage_sources: Vec<usize>,
    pub internal_resistances: Vec<usize>,
    pub current_sources: Vec<usize>,
    /// Node the pack current is injected from; its voltage is the pack
    /// terminal voltage.
    pub terminal_node: usize,
}

impl NetlistMap {
    pub fn cell_count(&self) -> usize {
        self.voltage_sources.len()
    }
}

impl Netlist {
    pub fn new(elements: Vec<Element>) -> Self {
        Self { elements }
    }

    /// Highest node id plus one (node 0 included).
    pub fn node_count(&self) -> usize {
        self.elements
            .iter()
            .map(|e| e.node1.max(e.node2) + 1)
            .max()
            .unwrap_or(0)
    }

    /// Locate the cell and terminal rows and check the netlist is usable by
    /// the pack solver.
    pub fn map(&self) -> Result<NetlistMap> {
        let rows_of = |kind: ElementKind| -> Vec<usize> {
            self.elements
                .iter()
                .enumerate()
                .filter(|(_, e)| e.kind == kind)
                .map(|(i, _)| i)
                .collect()
        };
        let voltage_sources = rows_of(ElementKind::VoltageSource);
        let internal_resistances = rows_of(ElementKind::InternalResistance);
        let current_sources = rows_of(ElementKind::CurrentSource);

        if voltage_sources.is_empty() {
            return Err(PackError::Config("netlist has no cell voltage sources".into()));
        }
        if voltage_sources.len() != internal_resistances.len() {
            return Err(PackError::Config(format!(
                "netlist has {} voltage sources but {} internal resistances",
                voltage_sources.len(),
                internal_resistances.len()
            )));
        }
        let Some(&first_current) = current_sources.first() else {
            return Err(PackError::Config("netlist has no terminal current source".into()));
        };
        if !self.elements.iter().any(|e| e.node1 == 0 || e.node2 == 0) {
            return Err(PackError::Config("netlist has no ground node 0".into()));
        }

        Ok(NetlistMap {
            terminal_node: self.elements[first_current].node1,
            voltage_sources,
            internal_resistances,
            current_sources,
        })
    }

    /// Write `values[k]` into row `rows[k]`.
    pub fn set_values(&mut self, rows: &[usize], values: &[f64]) {
        debug_assert_eq!(rows.len(), values.len());
        for (&row, &value) in rows.iter().zip(values) {
            self.elements[row].value = value;
        }
    }

    /// Write the same value into every listed row.
    pub fn fill_values(&mut self, rows: &[usize], value: f64) {
        for &row in rows {
            self.elements[row].value = value;
        }
    }
}

/// Build the netlist of a pack made of `series` groups of `parallel` cells.
///
/// Every cell is `V -> Ri -> Rc` between its group's negative and positive
/// bus; the last bus reaches the terminal through a busbar `Rb`, and the
/// current source draws `current` from the terminal to ground.
pub fn setup_circuit(
    parallel: usize,
    series: usize,
    busbar_resistance: f64,
    connection_resistance: f64,
    internal_resistance: f64,
    ocv: f64,
    current: f64,
) -> Result<Netlist> {
    if parallel == 0 || series == 0 {
        return Err(PackError::Config(format!(
            "pack topology {parallel}p{series}s has no cells"
        )));
    }
    for (name, r) in [
        ("busbar", busbar_resistance),
        ("connection", connection_resistance),
        ("internal", internal_resistance),
    ] {
        if !(r.is_finite() && r > 0.0) {
            return Err(PackError::Config(format!(
                "{name} resistance must be positive, got {r}"
            )));
        }
    }

    // Bus nodes 0..=series; per-cell nodes follow.
    let mut next_node = series + 1;
    let mut elements = Vec::with_capacity(3 * parallel * series + 2);
    for s in 0..series {
        for p in 0..parallel {
            let k = s * parallel + p;
            let positive = next_node;
            let tab = next_node + 1;
            next_node += 2;
            elements.push(Element::new(format!("V{k}"), positive, s, ocv)?);
            elements.push(Element::new(
                format!("Ri{k}"),
                positive,
                tab,
                internal_resistance,
            )?);
            elements.push(Element::new(
                format!("Rc{k}"),
                tab,
                s + 1,
                connection_resistance,
            )?);
        }
    }
    let terminal = next_node;
    elements.push(Element::new("Rb0", series, terminal, busbar_resistance)?);
    elements.push(Element::new("I0", terminal, 0, current)?);

    Ok(Netlist::new(elements))
}

/// Parse netlist text.
pub fn parse(input: &str) -> Result<Netlist> {
    let mut elements = Vec::new();
    for (line_num, raw_line) in input.lines().enumerate() {
        let line = raw_line.trim();
        if line.is_empty() || line.starts_with('#') || line.starts_with('*') {
            continue;
        }
        let (desc, node1, node2, value) = parse_element_line(line).map_err(|detail| {
            PackError::Netlist(format!("line {}: {} in: {}", line_num + 1, detail, raw_line))
        })?;
        let element = Element::new(desc, node1, node2, value).map_err(|e| match e {
            PackError::Netlist(detail) => {
                PackError::Netlist(format!("line {}: {}", line_num + 1, detail))
            }
            other => other,
        })?;
        elements.push(element);
    }
    if elements.is_empty() {
        return Err(PackError::Netlist("netlist is empty".into()));
    }
    Ok(Netlist::new(elements))
}

/// Write netlist text readable by [`parse`].
pub fn write<W: Write>(netlist: &Netlist, writer: &mut W) -> Result<()> {
    writeln!(writer, "# desc node1 node2 value")?;
    for e in &netlist.elements {
        writeln!(writer, "{} {} {} {:e}", e.desc, e.node1, e.node2, e.value)?;
    }
    Ok(())
}

fn parse_element_line(line: &str) -> std::result::Result<(&str, usize, usize, f64), String> {
    let (rest, (desc, _, node1, _, node2, _, value)) = (
        element_desc,
        space1,
        node_number,
        space1,
        node_number,
        space1,
        eng_value,
    )
        .parse(line)
        .map_err(|_| "expected 'desc node1 node2 value'".to_string())?;
    if !rest.trim().is_empty() {
        return Err(format!("unexpected trailing input '{}'", rest.trim()));
    }
    Ok((desc, node1, node2, value))
}

fn element_desc(input: &str) -> IResult<&str, &str> {
    take_while1(|c: char| !c.is_whitespace())(input)
}

fn node_number(input: &str) -> IResult<&str, usize> {
    map_res(digit1, str::parse::<usize>).parse(input)
}

/// Numeric value with an optional engineering suffix (10k, 5m, 2.2u).
fn eng_value(input: &str) -> IResult<&str, f64> {
    let (rest, num) = double(input)?;
    let (rest, suffix) = opt(eng_suffix).parse(rest)?;
    Ok((rest, num * suffix.unwrap_or(1.0)))
}

fn eng_suffix(input: &str) -> IResult<&str, f64> {
    // MEG before M
    alt((
        map(tag_no_case("MEG"), |_: &str| 1e6),
        map(tag_no_case("K"), |_: &str| 1e3),
        map(tag_no_case("M"), |_: &str| 1e-3),
        map(tag_no_case("U"), |_: &str| 1e-6),
        map(tag_no_case("N"), |_: &str| 1e-9),
        map(tag_no_case("P"), |_: &str| 1e-12),
    ))
    .parse(input)
}
