// 2C02 master palette, 0xAARRGGBB. The framebuffer uses the same byte order.
pub const MASTER_PALETTE: [u32; 64] = [
    0xFF545454, 0xFF001E74, 0xFF081090, 0xFF300088, 0xFF440064, 0xFF5C0030, 0xFF540400, 0xFF3C1800,
    0xFF202A00, 0xFF083A00, 0xFF004000, 0xFF003C00, 0xFF00302C, 0xFF000000, 0xFF000000, 0xFF000000,
    0xFF989698, 0xFF084CC4, 0xFF3032EC, 0xFF5C1EE4, 0xFF8814B0, 0xFFA01464, 0xFF982220, 0xFF783C00,
    0xFF545A00, 0xFF287200, 0xFF087C00, 0xFF007628, 0xFF006678, 0xFF000000, 0xFF000000, 0xFF000000,
    0xFFECEEEC, 0xFF3C7EEC, 0xFF5C5CEC, 0xFF8844EC, 0xFFB02CEC, 0xFFE028B0, 0xFFD83C50, 0xFFC45400,
    0xFFAC7000, 0xFF808800, 0xFF409C30, 0xFF20A458, 0xFF209A88, 0xFF404040, 0xFF000000, 0xFF000000,
    0xFFECEEEC, 0xFFA8BCEC, 0xFFBCACEC, 0xFFD4A0EC, 0xFFEC94EC, 0xFFEC90D4, 0xFFEC9CB4, 0xFFE4B090,
    0xFFDCC878, 0xFFD4DC78, 0xFFB8EC98, 0xFFA8ECBC, 0xFFA0E4E4, 0xFFA0A0A0, 0xFF000000, 0xFF000000,
];
