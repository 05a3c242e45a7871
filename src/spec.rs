//! Wire configurations
//!
//! Structured command payloads travel as XML name/value trees: a root tag
//! with child elements for fields, nested subtrees for regions, devices and
//! extensions. Small fixed requests (kill ids, file transfers) travel as
//! little-endian structs instead.

use std::fmt;

use hobbes_core::{AppId, EnclaveId};
use quick_xml::escape::escape;
use quick_xml::events::Event;
use quick_xml::Reader;
use xemem::SegId;

use crate::error::{HobbesError, Result};

// ———————————————————————————— Name/Value Trees ———————————————————————————— //

/// One element of a configuration tree: a tag, its text value, and child
/// elements.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct XmlNode {
    pub tag: String,
    pub text: String,
    pub children: Vec<XmlNode>,
}

impl XmlNode {
    pub fn new(tag: &str) -> XmlNode {
        XmlNode {
            tag: tag.to_string(),
            text: String::new(),
            children: Vec::new(),
        }
    }

    /// The value of the first child with the given tag, if it has one.
    pub fn val(&self, key: &str) -> Option<&str> {
        self.children
            .iter()
            .find(|child| child.tag == key)
            .map(|child| child.text.as_str())
            .filter(|text| !text.is_empty())
    }

    /// Set (or add) a child value.
    pub fn set_val(&mut self, key: &str, value: &str) {
        match self.children.iter_mut().find(|child| child.tag == key) {
            Some(child) => child.text = value.to_string(),
            None => {
                let mut child = XmlNode::new(key);
                child.text = value.to_string();
                self.children.push(child);
            }
        }
    }

    pub fn subtree(&self, key: &str) -> Option<&XmlNode> {
        self.children.iter().find(|child| child.tag == key)
    }

    pub fn subtree_mut(&mut self, key: &str) -> Option<&mut XmlNode> {
        self.children.iter_mut().find(|child| child.tag == key)
    }

    /// Append a new child subtree and return it.
    pub fn add_subtree(&mut self, tag: &str) -> &mut XmlNode {
        self.children.push(XmlNode::new(tag));
        self.children.last_mut().unwrap()
    }

    pub fn subtrees<'a>(&'a self, key: &'a str) -> impl Iterator<Item = &'a XmlNode> {
        self.children.iter().filter(move |child| child.tag == key)
    }

    pub fn remove_subtrees(&mut self, key: &str) {
        self.children.retain(|child| child.tag != key);
    }

    /// Parse a document into its root element.
    pub fn parse(input: &str) -> Result<XmlNode> {
        let mut reader = Reader::from_str(input);
        let mut stack: Vec<XmlNode> = Vec::new();
        let mut root: Option<XmlNode> = None;

        fn attach(node: XmlNode, stack: &mut [XmlNode], root: &mut Option<XmlNode>) -> Result<()> {
            match stack.last_mut() {
                Some(parent) => {
                    parent.children.push(node);
                    Ok(())
                }
                None if root.is_none() => {
                    *root = Some(node);
                    Ok(())
                }
                None => Err(HobbesError::invalid("multiple XML root elements")),
            }
        }

        loop {
            match reader.read_event() {
                Ok(Event::Start(start)) => {
                    let tag = String::from_utf8_lossy(start.name().as_ref()).into_owned();
                    stack.push(XmlNode::new(&tag));
                }
                Ok(Event::Empty(start)) => {
                    let tag = String::from_utf8_lossy(start.name().as_ref()).into_owned();
                    attach(XmlNode::new(&tag), &mut stack, &mut root)?;
                }
                Ok(Event::Text(text)) => {
                    let text = text
                        .unescape()
                        .map_err(|e| HobbesError::invalid(format!("bad XML text: {}", e)))?;
                    let trimmed = text.trim();
                    if !trimmed.is_empty() {
                        match stack.last_mut() {
                            Some(top) => top.text.push_str(trimmed),
                            None => {
                                return Err(HobbesError::invalid("text outside XML root"));
                            }
                        }
                    }
                }
                Ok(Event::End(_)) => {
                    let node = stack
                        .pop()
                        .ok_or_else(|| HobbesError::invalid("unbalanced XML end tag"))?;
                    attach(node, &mut stack, &mut root)?;
                }
                Ok(Event::Eof) => break,
                Ok(_) => {}
                Err(e) => {
                    return Err(HobbesError::invalid(format!("XML syntax error: {}", e)));
                }
            }
        }

        if !stack.is_empty() {
            return Err(HobbesError::invalid("unclosed XML element"));
        }
        root.ok_or_else(|| HobbesError::invalid("empty XML document"))
    }
}

impl fmt::Display for XmlNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.text.is_empty() && self.children.is_empty() {
            return write!(f, "<{}/>", self.tag);
        }
        write!(f, "<{}>{}", self.tag, escape(&self.text))?;
        for child in &self.children {
            write!(f, "{}", child)?;
        }
        write!(f, "</{}>", self.tag)
    }
}

// ——————————————————————————————— Wire Helpers ————————————————————————————— //

/// Serialize a tree for a command payload. The payload carries a trailing
/// NUL, and receivers verify it before parsing.
pub fn to_wire(node: &XmlNode) -> Vec<u8> {
    let mut bytes = node.to_string().into_bytes();
    bytes.push(0);
    bytes
}

pub fn from_wire(data: &[u8]) -> Result<XmlNode> {
    match data.split_last() {
        Some((0, body)) => {
            let text = std::str::from_utf8(body)
                .map_err(|_| HobbesError::invalid("payload is not UTF-8"))?;
            XmlNode::parse(text)
        }
        _ => Err(HobbesError::invalid("payload is not NUL-terminated")),
    }
}

/// Parse an integer, accepting the `0x` form addresses are written in.
pub fn parse_u64(s: &str) -> Option<u64> {
    let s = s.trim();
    match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        Some(hex) => u64::from_str_radix(hex, 16).ok(),
        None => s.parse().ok(),
    }
}

pub fn parse_u32(s: &str) -> Option<u32> {
    parse_u64(s).and_then(|v| u32::try_from(v).ok())
}

fn parse_flag(node: &XmlNode, key: &str) -> bool {
    node.val(key) == Some("1")
}

fn require<'a>(node: &'a XmlNode, key: &str) -> Result<&'a str> {
    node.val(key)
        .ok_or_else(|| HobbesError::invalid(format!("missing required field '{}'", key)))
}

fn require_u64(node: &XmlNode, key: &str) -> Result<u64> {
    parse_u64(require(node, key)?)
        .ok_or_else(|| HobbesError::invalid(format!("field '{}' is not a number", key)))
}

fn require_u32(node: &XmlNode, key: &str) -> Result<u32> {
    parse_u32(require(node, key)?)
        .ok_or_else(|| HobbesError::invalid(format!("field '{}' is not a number", key)))
}

/// Fixed id payload (kill and destroy requests).
pub fn encode_id(id: i32) -> Vec<u8> {
    (id as i64).to_le_bytes().to_vec()
}

pub fn decode_id(data: &[u8]) -> Result<i32> {
    let bytes: [u8; 8] = data
        .try_into()
        .map_err(|_| HobbesError::invalid("id payload is corrupt"))?;
    i32::try_from(i64::from_le_bytes(bytes))
        .map_err(|_| HobbesError::invalid("id payload is out of range"))
}

// —————————————————————————— Application Launches —————————————————————————— //

/// An application launch request.
#[derive(Debug, Clone, Default)]
pub struct AppSpec {
    pub path: String,
    pub name: Option<String>,
    pub argv: Option<String>,
    pub envp: Option<String>,
    pub ranks: Option<u32>,
    /// Comma separated hardware cpu ids.
    pub cpu_list: Option<String>,
    pub use_large_pages: bool,
    pub use_smartmap: bool,
    pub heap_size: Option<u64>,
    pub stack_size: Option<u64>,
    pub app_id: Option<AppId>,
    pub use_prealloc_mem: bool,
    pub data_pa: Option<u64>,
    pub heap_pa: Option<u64>,
    pub stack_pa: Option<u64>,
    /// Exported region segments handed to an I/O stub.
    pub data_segid: Option<SegId>,
    pub heap_segid: Option<SegId>,
    pub stack_segid: Option<SegId>,
}

impl AppSpec {
    pub fn new(path: &str) -> AppSpec {
        AppSpec {
            path: path.to_string(),
            ..AppSpec::default()
        }
    }

    pub fn to_xml(&self) -> XmlNode {
        let mut root = XmlNode::new("app");
        root.set_val("path", &self.path);

        if let Some(name) = &self.name {
            root.set_val("name", name);
        }
        if let Some(argv) = &self.argv {
            root.set_val("argv", argv);
        }
        if let Some(envp) = &self.envp {
            root.set_val("envp", envp);
        }
        if let Some(ranks) = self.ranks {
            root.set_val("ranks", &ranks.to_string());
        }
        if let Some(cpu_list) = &self.cpu_list {
            root.set_val("cpu_list", cpu_list);
        }
        if self.use_large_pages {
            root.set_val("use_large_pages", "1");
        }
        if self.use_smartmap {
            root.set_val("use_smartmap", "1");
        }
        if let Some(heap) = self.heap_size {
            root.set_val("heap_size", &heap.to_string());
        }
        if let Some(stack) = self.stack_size {
            root.set_val("stack_size", &stack.to_string());
        }
        if let Some(app_id) = self.app_id {
            root.set_val("app_id", &app_id.to_string());
        }
        if self.use_prealloc_mem {
            root.set_val("use_preallocated_memory", "1");
            if let Some(pa) = self.data_pa {
                root.set_val("data_pa", &format!("{:#x}", pa));
            }
            if let Some(pa) = self.heap_pa {
                root.set_val("heap_pa", &format!("{:#x}", pa));
            }
            if let Some(pa) = self.stack_pa {
                root.set_val("stack_pa", &format!("{:#x}", pa));
            }
        }
        if let Some(segid) = self.data_segid {
            root.set_val("data_segid", &segid.to_string());
        }
        if let Some(segid) = self.heap_segid {
            root.set_val("heap_segid", &segid.to_string());
        }
        if let Some(segid) = self.stack_segid {
            root.set_val("stack_segid", &segid.to_string());
        }
        root
    }

    pub fn from_xml(root: &XmlNode) -> Result<AppSpec> {
        if root.tag != "app" {
            return Err(HobbesError::invalid("not an app specification"));
        }

        let parse_segid = |key: &str| root.val(key).and_then(|s| s.parse::<SegId>().ok());

        Ok(AppSpec {
            path: require(root, "path")?.to_string(),
            name: root.val("name").map(str::to_string),
            argv: root.val("argv").map(str::to_string),
            envp: root.val("envp").map(str::to_string),
            ranks: root.val("ranks").and_then(parse_u32),
            cpu_list: root.val("cpu_list").map(str::to_string),
            use_large_pages: parse_flag(root, "use_large_pages"),
            use_smartmap: parse_flag(root, "use_smartmap"),
            heap_size: root.val("heap_size").and_then(parse_u64),
            stack_size: root.val("stack_size").and_then(parse_u64),
            app_id: root
                .val("app_id")
                .and_then(|s| s.parse().ok())
                .map(AppId),
            use_prealloc_mem: parse_flag(root, "use_preallocated_memory"),
            data_pa: root.val("data_pa").and_then(parse_u64),
            heap_pa: root.val("heap_pa").and_then(parse_u64),
            stack_pa: root.val("stack_pa").and_then(parse_u64),
            data_segid: parse_segid("data_segid"),
            heap_segid: parse_segid("heap_segid"),
            stack_segid: parse_segid("stack_segid"),
        })
    }

    pub fn to_wire(&self) -> Vec<u8> {
        to_wire(&self.to_xml())
    }

    pub fn from_wire(data: &[u8]) -> Result<AppSpec> {
        AppSpec::from_xml(&from_wire(data)?)
    }
}

// ——————————————————————————————— VM Launches —————————————————————————————— //

/// A VM launch configuration.
///
/// Only the fields the fabric itself needs are typed; the `devices` subtree
/// is carried opaquely for the hosting VMM.
#[derive(Debug, Clone)]
pub struct VmSpec {
    pub root: XmlNode,
}

impl VmSpec {
    pub fn from_node(root: XmlNode) -> Result<VmSpec> {
        if root.tag != "vm" {
            return Err(HobbesError::invalid("not a vm specification"));
        }
        Ok(VmSpec { root })
    }

    pub fn parse(input: &str) -> Result<VmSpec> {
        VmSpec::from_node(XmlNode::parse(input)?)
    }

    pub fn name(&self) -> Option<&str> {
        self.root.val("name")
    }

    pub fn set_name(&mut self, name: &str) {
        self.root.set_val("name", name);
    }

    pub fn enclave_id(&self) -> Result<EnclaveId> {
        let id = require(&self.root, "enclave_id")?;
        id.parse()
            .map(EnclaveId)
            .map_err(|_| HobbesError::invalid("bad 'enclave_id' field"))
    }

    pub fn set_enclave_id(&mut self, id: EnclaveId) {
        self.root.set_val("enclave_id", &id.to_string());
    }

    pub fn host_enclave(&self) -> Option<&str> {
        self.root.val("host_enclave")
    }

    pub fn memory(&self) -> Result<&XmlNode> {
        self.root
            .subtree("memory")
            .ok_or_else(|| HobbesError::invalid("missing memory configuration block"))
    }

    pub fn memory_mut(&mut self) -> Result<&mut XmlNode> {
        self.root
            .subtree_mut("memory")
            .ok_or_else(|| HobbesError::invalid("missing memory configuration block"))
    }

    /// Tag the configuration with the enclave identity the guest runtime
    /// reads at boot.
    pub fn ensure_hobbes_env(&mut self, enclave_id: EnclaveId) {
        if self.root.subtree("extensions").is_none() {
            self.root.add_subtree("extensions");
        }
        let extensions = self.root.subtree_mut("extensions").unwrap();

        let ext = extensions
            .children
            .iter_mut()
            .find(|ext| ext.tag == "extension" && ext.val("name") == Some("HOBBES_ENV"));
        match ext {
            Some(ext) => ext.set_val("enclave_id", &enclave_id.to_string()),
            None => {
                let ext = extensions.add_subtree("extension");
                ext.set_val("name", "HOBBES_ENV");
                ext.set_val("enclave_id", &enclave_id.to_string());
            }
        }
    }

    pub fn to_wire(&self) -> Vec<u8> {
        to_wire(&self.root)
    }

    pub fn from_wire(data: &[u8]) -> Result<VmSpec> {
        VmSpec::from_node(from_wire(data)?)
    }
}

// —————————————————————————— Resource Assignments —————————————————————————— //

/// Memory handed to an enclave's kernel (AddMem / RemoveMem).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemAssignSpec {
    pub base_addr: u64,
    pub size: u64,
    pub allocated: bool,
    pub zeroed: bool,
}

impl MemAssignSpec {
    pub fn to_xml(&self) -> XmlNode {
        let mut root = XmlNode::new("memory");
        root.set_val("base_addr", &format!("{:#x}", self.base_addr));
        root.set_val("size", &self.size.to_string());
        root.set_val("allocated", if self.allocated { "1" } else { "0" });
        root.set_val("zeroed", if self.zeroed { "1" } else { "0" });
        root
    }

    pub fn from_xml(root: &XmlNode) -> Result<MemAssignSpec> {
        if root.tag != "memory" {
            return Err(HobbesError::invalid("not a memory specification"));
        }
        Ok(MemAssignSpec {
            base_addr: require_u64(root, "base_addr")?,
            size: require_u64(root, "size")?,
            allocated: parse_flag(root, "allocated"),
            zeroed: parse_flag(root, "zeroed"),
        })
    }

    pub fn to_wire(&self) -> Vec<u8> {
        to_wire(&self.to_xml())
    }

    pub fn from_wire(data: &[u8]) -> Result<MemAssignSpec> {
        MemAssignSpec::from_xml(&from_wire(data)?)
    }
}

/// A CPU handed to an enclave's kernel (AddCpu / RemoveCpu).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CpuAssignSpec {
    pub phys_cpu_id: u32,
    pub apic_id: u32,
}

impl CpuAssignSpec {
    pub fn to_xml(&self) -> XmlNode {
        let mut root = XmlNode::new("cpus");
        root.set_val("phys_cpu_id", &self.phys_cpu_id.to_string());
        root.set_val("apic_id", &self.apic_id.to_string());
        root
    }

    pub fn from_xml(root: &XmlNode) -> Result<CpuAssignSpec> {
        if root.tag != "cpus" {
            return Err(HobbesError::invalid("not a cpu specification"));
        }
        Ok(CpuAssignSpec {
            phys_cpu_id: require_u32(root, "phys_cpu_id")?,
            apic_id: require_u32(root, "apic_id")?,
        })
    }

    pub fn to_wire(&self) -> Vec<u8> {
        to_wire(&self.to_xml())
    }

    pub fn from_wire(data: &[u8]) -> Result<CpuAssignSpec> {
        CpuAssignSpec::from_xml(&from_wire(data)?)
    }
}

/// A remote file open request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileOpenSpec {
    pub path: String,
    pub flags: u32,
}

impl FileOpenSpec {
    pub fn to_xml(&self) -> XmlNode {
        let mut root = XmlNode::new("file");
        root.set_val("path", &self.path);
        root.set_val("flags", &self.flags.to_string());
        root
    }

    pub fn from_xml(root: &XmlNode) -> Result<FileOpenSpec> {
        if root.tag != "file" {
            return Err(HobbesError::invalid("not a file specification"));
        }
        Ok(FileOpenSpec {
            path: require(root, "path")?.to_string(),
            flags: require_u32(root, "flags")?,
        })
    }

    pub fn to_wire(&self) -> Vec<u8> {
        to_wire(&self.to_xml())
    }

    pub fn from_wire(data: &[u8]) -> Result<FileOpenSpec> {
        FileOpenSpec::from_xml(&from_wire(data)?)
    }
}

// ————————————————————————————————— Tests —————————————————————————————————— //

#[cfg(test)]
mod tests {
    use hobbes_core::AppId;

    use super::*;

    #[test]
    fn tree_parse_and_emit() {
        let text = "<vm><name>test</name><memory><size>256</size>\
                    <region><host_addr>0x8000000</host_addr><size>134217728</size></region>\
                    </memory><devices/></vm>";
        let node = XmlNode::parse(text).unwrap();

        assert_eq!(node.tag, "vm");
        assert_eq!(node.val("name"), Some("test"));
        let memory = node.subtree("memory").unwrap();
        assert_eq!(memory.val("size"), Some("256"));
        let region = memory.subtree("region").unwrap();
        assert_eq!(parse_u64(region.val("host_addr").unwrap()), Some(0x8000000));

        // Emitting and reparsing yields the same tree.
        let reparsed = XmlNode::parse(&node.to_string()).unwrap();
        assert_eq!(reparsed, node);
    }

    #[test]
    fn malformed_documents_are_rejected() {
        assert!(XmlNode::parse("").is_err());
        assert!(XmlNode::parse("<a><b></a>").is_err());
        assert!(XmlNode::parse("<a/><b/>").is_err());
        assert!(from_wire(b"<app/>").is_err());
    }

    #[test]
    fn text_escaping_round_trips() {
        let mut node = XmlNode::new("app");
        node.set_val("argv", "-n 1 --mode=<fast> & verbose");
        let reparsed = XmlNode::parse(&node.to_string()).unwrap();
        assert_eq!(reparsed.val("argv"), Some("-n 1 --mode=<fast> & verbose"));
    }

    #[test]
    fn app_spec_round_trip() {
        let mut spec = AppSpec::new("/bin/bench");
        spec.name = Some(String::from("bench"));
        spec.argv = Some(String::from("-n 4"));
        spec.ranks = Some(4);
        spec.cpu_list = Some(String::from("0,1,2"));
        spec.use_large_pages = true;
        spec.heap_size = Some(16 * 1024 * 1024);
        spec.app_id = Some(AppId(7));
        spec.use_prealloc_mem = true;
        spec.data_pa = Some(0x10000000);
        spec.heap_pa = Some(0x18000000);
        spec.stack_pa = Some(0x20000000);

        let parsed = AppSpec::from_wire(&spec.to_wire()).unwrap();
        assert_eq!(parsed.path, "/bin/bench");
        assert_eq!(parsed.name.as_deref(), Some("bench"));
        assert_eq!(parsed.ranks, Some(4));
        assert!(parsed.use_large_pages);
        assert!(!parsed.use_smartmap);
        assert_eq!(parsed.app_id, Some(AppId(7)));
        assert!(parsed.use_prealloc_mem);
        assert_eq!(parsed.data_pa, Some(0x10000000));
        assert_eq!(parsed.heap_pa, Some(0x18000000));
        assert_eq!(parsed.stack_pa, Some(0x20000000));
    }

    #[test]
    fn app_spec_requires_a_path() {
        assert!(AppSpec::from_xml(&XmlNode::parse("<app><name>x</name></app>").unwrap()).is_err());
    }

    #[test]
    fn vm_spec_identity_injection() {
        let mut spec = VmSpec::parse(
            "<vm><name>vm0</name><memory><size>256</size></memory><devices/></vm>",
        )
        .unwrap();

        assert!(spec.enclave_id().is_err());
        spec.set_enclave_id(hobbes_core::EnclaveId(3));
        spec.ensure_hobbes_env(hobbes_core::EnclaveId(3));
        // A second injection updates in place rather than duplicating.
        spec.ensure_hobbes_env(hobbes_core::EnclaveId(3));

        let parsed = VmSpec::from_wire(&spec.to_wire()).unwrap();
        assert_eq!(parsed.enclave_id().unwrap(), hobbes_core::EnclaveId(3));
        let extensions = parsed.root.subtree("extensions").unwrap();
        let exts: Vec<_> = extensions.subtrees("extension").collect();
        assert_eq!(exts.len(), 1);
        assert_eq!(exts[0].val("name"), Some("HOBBES_ENV"));
        assert_eq!(exts[0].val("enclave_id"), Some("3"));
    }

    #[test]
    fn assignment_specs_round_trip() {
        let mem = MemAssignSpec {
            base_addr: 0x40000000,
            size: 128 * 1024 * 1024,
            allocated: true,
            zeroed: false,
        };
        assert_eq!(MemAssignSpec::from_wire(&mem.to_wire()).unwrap(), mem);

        let cpu = CpuAssignSpec {
            phys_cpu_id: 5,
            apic_id: 10,
        };
        assert_eq!(CpuAssignSpec::from_wire(&cpu.to_wire()).unwrap(), cpu);

        let file = FileOpenSpec {
            path: String::from("/etc/hosts"),
            flags: 0,
        };
        assert_eq!(FileOpenSpec::from_wire(&file.to_wire()).unwrap(), file);
    }

    #[test]
    fn id_payloads() {
        assert_eq!(decode_id(&encode_id(42)).unwrap(), 42);
        assert_eq!(decode_id(&encode_id(-1)).unwrap(), -1);
        assert!(decode_id(b"short").is_err());
    }
}
