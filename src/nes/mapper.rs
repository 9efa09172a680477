use super::cartridge::Cartridge;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mirroring {
    Horizontal,
    Vertical,
    OneScreenLower,
    OneScreenUpper,
    FourScreen,
}

pub trait Mapper {
    fn cpu_read(&mut self, addr: u16) -> u8;
    fn cpu_write(&mut self, addr: u16, value: u8);
    fn ppu_read(&mut self, addr: u16) -> u8;
    fn ppu_write(&mut self, addr: u16, value: u8);
    fn mirroring(&self) -> Mirroring;
    fn debug_peek_chr(&self, _addr: u16) -> u8 {
        0
    }
    fn debug_peek_prg(&self, _addr: u16) -> u8 {
        0
    }
}

pub fn mapper_name(mapper_id: u8) -> &'static str {
    match mapper_id {
        0 => "NROM",
        _ => "Unsupported",
    }
}

/// Header validation has already rejected everything but mapper 0, so
/// construction cannot fail.
pub fn create_mapper(cart: Cartridge) -> Box<dyn Mapper> {
    Box::new(Nrom::new(cart))
}

struct Nrom {
    prg_rom: Vec<u8>,
    prg_mask: usize,
    chr: Vec<u8>,
    chr_mask: usize,
    chr_is_ram: bool,
    prg_ram: Vec<u8>,
    mirroring: Mirroring,
}

impl Nrom {
    fn new(cart: Cartridge) -> Self {
        // PRG is 16K or 32K and CHR is always 8K here, so a power-of-two
        // mask covers both the flat map and the 16K mirror.
        let prg_mask = cart.prg_rom.len() - 1;
        let chr_mask = cart.chr_data.len() - 1;
        Self {
            prg_rom: cart.prg_rom,
            prg_mask,
            chr: cart.chr_data,
            chr_mask,
            chr_is_ram: cart.chr_is_ram,
            prg_ram: vec![0; 8 * 1024],
            mirroring: cart.mirroring,
        }
    }
}

impl Mapper for Nrom {
    fn cpu_read(&mut self, addr: u16) -> u8 {
        match addr {
            0x6000..=0x7FFF => self.prg_ram[addr as usize & 0x1FFF],
            0x8000..=0xFFFF => self.prg_rom[addr as usize & self.prg_mask],
            _ => 0,
        }
    }

    fn cpu_write(&mut self, addr: u16, value: u8) {
        if (0x6000..=0x7FFF).contains(&addr) {
            self.prg_ram[addr as usize & 0x1FFF] = value;
        }
    }

    fn ppu_read(&mut self, addr: u16) -> u8 {
        self.chr[addr as usize & self.chr_mask]
    }

    fn ppu_write(&mut self, addr: u16, value: u8) {
        if self.chr_is_ram {
            let idx = addr as usize & self.chr_mask;
            self.chr[idx] = value;
        }
    }

    fn mirroring(&self) -> Mirroring {
        self.mirroring
    }

    fn debug_peek_chr(&self, addr: u16) -> u8 {
        self.chr[addr as usize & self.chr_mask]
    }

    fn debug_peek_prg(&self, addr: u16) -> u8 {
        match addr {
            0x6000..=0x7FFF => self.prg_ram[addr as usize & 0x1FFF],
            0x8000..=0xFFFF => self.prg_rom[addr as usize & self.prg_mask],
            _ => 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn patterned_banks(total_size: usize, bank_size: usize) -> Vec<u8> {
        let mut data = vec![0u8; total_size];
        for (bank, chunk) in data.chunks_mut(bank_size).enumerate() {
            chunk.fill((bank as u8).wrapping_add(1));
        }
        data
    }

    fn make_cart(prg_rom: Vec<u8>, chr_data: Vec<u8>, chr_is_ram: bool) -> Cartridge {
        Cartridge {
            mapper_id: 0,
            mirroring: Mirroring::Vertical,
            has_battery_backed_ram: false,
            prg_rom,
            chr_data,
            chr_is_ram,
        }
    }

    #[test]
    fn nrom_mirrors_16k_prg_into_both_banks() {
        let mut prg = vec![0u8; 0x4000];
        prg[0x0000] = 0xAA;
        prg[0x3FFF] = 0xBB;
        let mut mapper = Nrom::new(make_cart(prg, vec![0; 0x2000], false));

        assert_eq!(mapper.cpu_read(0x8000), 0xAA);
        assert_eq!(mapper.cpu_read(0xC000), 0xAA);
        assert_eq!(mapper.cpu_read(0xBFFF), 0xBB);
        assert_eq!(mapper.cpu_read(0xFFFF), 0xBB);
    }

    #[test]
    fn nrom_maps_32k_prg_flat() {
        let prg = patterned_banks(0x8000, 0x4000);
        let mut mapper = Nrom::new(make_cart(prg, vec![0; 0x2000], false));

        assert_eq!(mapper.cpu_read(0x8000), 1);
        assert_eq!(mapper.cpu_read(0xC000), 2);
        assert_eq!(mapper.cpu_read(0xFFFF), 2);
    }

    #[test]
    fn nrom_prg_ram_round_trips() {
        let prg = patterned_banks(0x4000, 0x4000);
        let mut mapper = Nrom::new(make_cart(prg, vec![0; 0x2000], false));

        mapper.cpu_write(0x6000, 0x5A);
        mapper.cpu_write(0x7FFF, 0xA5);
        assert_eq!(mapper.cpu_read(0x6000), 0x5A);
        assert_eq!(mapper.cpu_read(0x7FFF), 0xA5);
    }

    #[test]
    fn nrom_rejects_writes_to_chr_rom() {
        let prg = patterned_banks(0x4000, 0x4000);
        let chr = patterned_banks(0x2000, 0x2000);
        let mut mapper = Nrom::new(make_cart(prg, chr, false));

        mapper.ppu_write(0x0010, 0xEE);
        assert_eq!(mapper.ppu_read(0x0010), 1);
    }

    #[test]
    fn nrom_accepts_writes_to_chr_ram() {
        let prg = patterned_banks(0x4000, 0x4000);
        let mut mapper = Nrom::new(make_cart(prg, vec![0; 0x2000], true));

        mapper.ppu_write(0x1FFF, 0xEE);
        assert_eq!(mapper.ppu_read(0x1FFF), 0xEE);
    }

    #[test]
    fn nrom_reports_header_mirroring() {
        let prg = patterned_banks(0x4000, 0x4000);
        let mapper = Nrom::new(make_cart(prg, vec![0; 0x2000], false));

        assert_eq!(mapper.mirroring(), Mirroring::Vertical);
    }

    #[test]
    fn mapper_names_cover_supported_range() {
        assert_eq!(mapper_name(0), "NROM");
        assert_eq!(mapper_name(4), "Unsupported");
    }
}
