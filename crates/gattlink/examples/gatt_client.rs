use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use gattlink::{AddressType, Peripheral};
use std::env;
use std::io::{self, Read, Write};
use std::net::TcpStream;

/// Read half of the bridge: every PDU is preceded by its length as a
/// little-endian u16, so each `read` yields exactly one PDU.
struct FramedReader(TcpStream);

impl Read for FramedReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let length = match self.0.read_u16::<LittleEndian>() {
            Ok(length) => length as usize,
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(0),
            Err(e) => return Err(e),
        };
        let mut pdu = vec![0u8; length];
        self.0.read_exact(&mut pdu)?;
        let n = length.min(buf.len());
        buf[..n].copy_from_slice(&pdu[..n]);
        Ok(n)
    }
}

/// Write half of the bridge: each `write` call carries one PDU.
struct FramedWriter(TcpStream);

impl Write for FramedWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let length = u16::try_from(buf.len())
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "PDU too long"))?;
        self.0.write_u16::<LittleEndian>(length)?;
        self.0.write_all(buf)?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        self.0.flush()
    }
}

/// Walks the attribute graph of a peripheral whose ATT bearer is bridged to
/// a TCP socket with u16 length-prefixed PDUs, e.g.
/// `gatt_client 127.0.0.1:9000 A0:14:3D:47:25:02`.
fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args: Vec<String> = env::args().collect();
    if args.len() < 3 {
        return Err("usage: gatt_client <bridge host:port> <address> [eir hex]".into());
    }

    let stream = TcpStream::connect(&args[1])?;
    let reader = FramedReader(stream.try_clone()?);
    let peripheral = Peripheral::new(
        &args[2],
        AddressType::Public,
        reader,
        FramedWriter(stream),
    )?;

    if let Some(eir) = args.get(3) {
        peripheral.update_advertisement(&hex::decode(eir)?)?;
    }
    println!(
        "Peripheral {} ({})",
        peripheral.id(),
        peripheral.name().unwrap_or_else(|| "unnamed".to_string())
    );

    for service in peripheral.discover_services(&[])? {
        println!("{}", service);
        for characteristic in peripheral.discover_characteristics(&service, &[])? {
            println!("  {}", characteristic);
            for descriptor in peripheral.discover_descriptors(&characteristic, &[])? {
                println!("    Descriptor {} at 0x{:04X}", descriptor.uuid, descriptor.handle);
            }
            if characteristic.properties.can_read() {
                match peripheral.read_characteristic(&characteristic) {
                    Ok(value) => println!("    Value: {}", hex::encode(value)),
                    Err(e) => println!("    Read failed: {}", e),
                }
            }
        }
    }

    peripheral.disconnect();
    Ok(())
}
