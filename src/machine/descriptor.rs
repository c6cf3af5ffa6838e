use std::fmt::Write;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DomainDescriptor {
    pub name: String,
    pub memory_mib: u64,
    pub vcpus: u32,
    pub disk_path: String,
    pub cloud_init_path: String,
    pub network: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VolumeCapacity {
    Bytes(u64),
    GiB(u64),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackingStore {
    pub path: String,
    pub format: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VolumeDescriptor {
    pub name: String,
    pub capacity: VolumeCapacity,
    pub format: String,
    pub backing_store: Option<BackingStore>,
}

impl VolumeDescriptor {
    /// qcow2 overlay on top of an image that already lives on the host.
    pub fn overlay(
        name: impl AsRef<str>,
        size_gib: u64,
        backing_path: impl AsRef<str>,
        backing_format: impl AsRef<str>,
    ) -> Self {
        Self {
            name: name.as_ref().to_string(),
            capacity: VolumeCapacity::GiB(size_gib),
            format: "qcow2".to_string(),
            backing_store: Some(BackingStore {
                path: backing_path.as_ref().to_string(),
                format: backing_format.as_ref().to_string(),
            }),
        }
    }

    pub fn raw(name: impl AsRef<str>, size_bytes: u64) -> Self {
        Self {
            name: name.as_ref().to_string(),
            capacity: VolumeCapacity::Bytes(size_bytes),
            format: "raw".to_string(),
            backing_store: None,
        }
    }

    pub fn capacity_bytes(&self) -> u64 {
        match self.capacity {
            VolumeCapacity::Bytes(bytes) => bytes,
            VolumeCapacity::GiB(gib) => gib.saturating_mul(1 << 30),
        }
    }

    pub fn to_xml(&self) -> String {
        let (unit, capacity) = match self.capacity {
            VolumeCapacity::Bytes(bytes) => ("bytes", bytes),
            VolumeCapacity::GiB(gib) => ("GiB", gib),
        };

        let mut xml = String::new();
        let _ = writeln!(xml, "<volume>");
        let _ = writeln!(xml, "  <name>{}</name>", escape(&self.name));
        let _ = writeln!(xml, "  <capacity unit='{}'>{}</capacity>", unit, capacity);
        let _ = writeln!(xml, "  <target>");
        let _ = writeln!(xml, "    <format type='{}'/>", escape(&self.format));
        let _ = writeln!(xml, "  </target>");
        if let Some(backing) = &self.backing_store {
            let _ = writeln!(xml, "  <backingStore>");
            let _ = writeln!(xml, "    <path>{}</path>", escape(&backing.path));
            let _ = writeln!(xml, "    <format type='{}'/>", escape(&backing.format));
            let _ = writeln!(xml, "  </backingStore>");
        }
        let _ = writeln!(xml, "</volume>");
        xml
    }
}

impl DomainDescriptor {
    pub fn to_xml(&self) -> String {
        format!(
            r#"<domain type='kvm'>
  <name>{name}</name>
  <memory unit='MiB'>{memory}</memory>
  <vcpu>{vcpus}</vcpu>
  <os>
    <type arch='x86_64'>hvm</type>
    <boot dev='hd'/>
  </os>
  <devices>
    <disk type='file' device='disk'>
      <driver name='qemu' type='qcow2'/>
      <source file='{disk}'/>
      <target dev='vda' bus='virtio'/>
    </disk>
    <disk type='file' device='cdrom'>
      <driver name='qemu' type='raw'/>
      <source file='{cloud_init}'/>
      <target dev='hda' bus='ide'/>
      <readonly/>
    </disk>
    <interface type='network'>
      <source network='{network}'/>
      <model type='virtio'/>
    </interface>
    <serial type='pty'>
      <target type='isa-serial' port='0'>
        <model name='isa-serial'/>
      </target>
    </serial>
    <console type='pty'>
      <target type='serial' port='0'/>
    </console>
  </devices>
</domain>
"#,
            name = escape(&self.name),
            memory = self.memory_mib,
            vcpus = self.vcpus,
            disk = escape(&self.disk_path),
            cloud_init = escape(&self.cloud_init_path),
            network = escape(&self.network),
        )
    }
}

fn escape(value: &str) -> String {
    let mut escaped = String::with_capacity(value.len());
    for c in value.chars() {
        match c {
            '&' => escaped.push_str("&amp;"),
            '<' => escaped.push_str("&lt;"),
            '>' => escaped.push_str("&gt;"),
            '\'' => escaped.push_str("&apos;"),
            '"' => escaped.push_str("&quot;"),
            c => escaped.push(c),
        }
    }
    escaped
}
