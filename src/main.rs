mod cli;

use anyhow::{Context, Result};
use clap::Parser;
use cli::Cli;
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

use pcitree::device::allocator::{allocate_domain, TreeAllocator};
use pcitree::device::board::{BoardConfig, StaticDevice};
use pcitree::device::ops::EmptyRegistry;
use pcitree::device::resource::{ram_index, ResourceFlags};
use pcitree::device::tree::log_tree;
use pcitree::pci::{commit, discover, scan};
use pcitree::sim::config_space::SimDeviceBuilder;
use pcitree::sim::host::{SimBus, SimHost};

/// A small machine to enumerate: a host bridge, an ethernet controller, a
/// two-function storage controller and a PCI-to-PCI bridge with a device
/// behind it.
fn demo_machine() -> SimHost {
    let mut host = SimHost::new();

    host.plug(
        0,
        SimDeviceBuilder::new(0x8086, 0x1237)
            .class(0x06, 0x00, 0x00)
            .device(),
    );

    host.plug(
        2 << 3,
        SimDeviceBuilder::new(0x8086, 0x100E)
            .class(0x02, 0x00, 0x00)
            .interrupt_pin(1)
            .mem32_bar(0, 0x2_0000)
            .io_bar(1, 0x40)
            .rom_bar(0x4_0000)
            .device(),
    );

    host.plug(
        3 << 3,
        SimDeviceBuilder::new(0x8086, 0x2922)
            .class(0x01, 0x06, 0x01)
            .interrupt_pin(1)
            .multifunction()
            .mem32_bar(0, 0x1000)
            .device(),
    );
    host.plug(
        (3 << 3) | 1,
        SimDeviceBuilder::new(0x8086, 0x2926)
            .class(0x01, 0x06, 0x01)
            .interrupt_pin(2)
            .mem32_bar(0, 0x1000)
            .device(),
    );

    let mut behind = SimBus::new();
    behind.plug(
        0,
        SimDeviceBuilder::new(0x10DE, 0x2206)
            .class(0x03, 0x00, 0x00)
            .interrupt_pin(1)
            .mem32_bar(0, 0x100_0000)
            .mem64_prefetchable_bar(1, 0x1000_0000)
            .device(),
    );
    host.root_mut().plug_bridge(
        4 << 3,
        SimDeviceBuilder::bridge(0x8086, 0x244E)
            .io_window()
            .mem_window()
            .pref_window(),
        behind,
    );

    host
}

fn main() -> Result<()> {
    let args = Cli::parse();

    let subscriber = FmtSubscriber::builder()
        .with_max_level(match args.verbose {
            0 => Level::INFO,
            1 => Level::DEBUG,
            _ => Level::TRACE,
        })
        .finish();

    tracing::subscriber::set_global_default(subscriber)
        .context("Failed to set global tracing subscriber")?;

    let mut host = demo_machine();

    // The board knows the ethernet controller is soldered down and
    // expects a legacy device at 00:1f.0 that this machine does not have.
    let board = BoardConfig {
        domain: 0,
        devices: vec![
            StaticDevice::at(2, 0).subsystem(0x8086, 0x0001),
            StaticDevice::at(0x1F, 0),
        ],
    };

    let mut root = board
        .build_tree()
        .context("Invalid static board configuration")?;
    discover::read_domain_resources(&mut root);
    discover::add_ram_resource(&mut root, ram_index(0), 0, 640);
    discover::add_ram_resource(&mut root, ram_index(1), 768, 255 * 1024);

    info!("scanning");
    scan::scan_domain(&mut host, &mut root, 0, &EmptyRegistry);

    info!("sizing resources");
    let mut alloc = TreeAllocator;
    {
        let link = root
            .link
            .as_deref_mut()
            .context("Domain root lost its bus")?;
        discover::read_bus_resources(&mut host, link, &mut alloc);
    }

    info!("placing resources");
    for res in &mut root.resources {
        if !res.flags.contains(ResourceFlags::SUBTRACTIVE) {
            continue;
        }
        res.base = if res.flags.contains(ResourceFlags::IO) {
            args.io_base
        } else {
            args.mem_base
        };
    }
    allocate_domain(&mut root, &mut alloc);

    info!("committing");
    {
        let link = root
            .link
            .as_deref_mut()
            .context("Domain root lost its bus")?;
        commit::assign_bus_resources(&mut host, link, &mut alloc);
    }
    commit::enable_tree(&mut host, &mut root);

    log_tree(&root);

    Ok(())
}
